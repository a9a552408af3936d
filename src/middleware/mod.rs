/*
 * Responsibility
 * - 入場判定 middleware の公開インターフェース (re-export)
 * - 適用順は pipeline 側で決める (service_account → throttle → logout)
 */
pub mod logout;
pub mod service_account;
pub mod throttle;
