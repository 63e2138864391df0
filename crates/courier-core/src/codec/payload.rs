//! Payload trait - payload_type と Rust 型の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Payload は payload_type と型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct UserLoggedIn {
///     user_id: String,
/// }
///
/// impl Payload for UserLoggedIn {
///     const TYPE: &'static str = "user.auth.logged_in.v1";
/// }
/// ```
///
/// # 命名規約
/// - `{domain}.{concern}.{event}.v{major}`
/// - 1 つの topic に複数の payload_type が流れてよい
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
