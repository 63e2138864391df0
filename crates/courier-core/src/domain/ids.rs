//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの EventId
//! envelope の `id` は ULID。生成時刻でソート可能で、複数のサービスレプリカが
//! 調整なしで採番できる。一度採番したら redelivery / hospital まで変わらない
//! （consumer の冪等キー）。
//!
//! ## Phantom Type パターン
//! `Id<T>` は共通実装、`T` はコンパイル時だけ使うマーカー型。
//!
//! # Surrogate row id
//! outbox / hospital の行 id は store が採番する連番で、envelope id とは別物。

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "evt-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// wire 上は素の ULID 文字列。プレフィックスは Display（ログ）でだけ付く。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ulid::DecodeError;

    /// プレフィックス付き・なしのどちらも受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).map(Self::from_ulid)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.ulid.serialize(serializer)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ulid::deserialize(deserializer).map(Self::from_ulid)
    }
}

/// Event のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {}

impl IdMarker for Event {
    fn prefix() -> &'static str {
        "evt-"
    }
}

/// Identifier of one logical event (stable across redelivery).
pub type EventId = Id<Event>;

/// Surrogate primary key of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxRowId(pub i64);

impl fmt::Display for OutboxRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "outbox#{}", self.0)
    }
}

/// Surrogate primary key of a hospital row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HospitalRowId(pub i64);

impl fmt::Display for HospitalRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hospital#{}", self.0)
    }
}

/// Correlation id of the originating request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// request boundary で相関 id が無い場合に採番する
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
