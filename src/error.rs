/*
 * Responsibility
 * - リクエスト処理で返す共通エラー (AppError) の定義
 * - IntoResponse 実装 (HTTP status / plain text body)
 * - 認証の判断は gate 側、ここは変換のみ
 */
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Throttling needs a basic-auth identity and none could be extracted.
    #[error("no valid basic auth credentials")]
    MissingCredentials,

    /// The caller's token bucket is empty. Expected operational condition,
    /// never logged as an error.
    #[error("too many requests")]
    Throttled,

    /// The request body could not be buffered for classification.
    #[error("failed to read request body")]
    BodyRead,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::MissingCredentials => {
                (StatusCode::BAD_REQUEST, "No valid basic auth credentials")
            }
            AppError::Throttled => (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests"),
            AppError::BodyRead => (StatusCode::BAD_REQUEST, "Failed to read request body"),
        };
        (status, message).into_response()
    }
}
