//! PayloadDecoders - payload_type → decoder の登録表
//!
//! `payloadType.equals(...)` の分岐を並べる代わりに、起動時に decoder を一度だけ
//! 登録して、payload_type から型付きの variant を得る。
//!
//! # 学習ポイント
//! - 関数ポインタと Box<dyn Fn> による型消去
//! - アプリ側の enum `E` への tagged-union decode

use std::collections::HashMap;

use super::payload::Payload;
use crate::domain::EventEnvelope;
use crate::error::{CodecError, RegistryError};

type DecodeFn<E> = Box<dyn Fn(&str) -> Result<E, CodecError> + Send + Sync>;

/// Maps a `payload_type` tag to a decoder producing a variant of `E`.
///
/// # 使用例
/// ```ignore
/// enum UserEvent {
///     LoggedIn(UserLoggedIn),
///     LoggedOut(UserLoggedOut),
/// }
///
/// let decoders = PayloadDecoders::new()
///     .with::<UserLoggedIn>(UserEvent::LoggedIn)?
///     .with::<UserLoggedOut>(UserEvent::LoggedOut)?;
/// let event = decoders.decode_envelope(&envelope)?;
/// ```
pub struct PayloadDecoders<E> {
    decoders: HashMap<&'static str, DecodeFn<E>>,
}

impl<E: 'static> PayloadDecoders<E> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register<P: Payload>(&mut self, wrap: fn(P) -> E) -> Result<(), RegistryError> {
        if self.decoders.contains_key(P::TYPE) {
            return Err(RegistryError::DuplicateDecoder(P::TYPE.to_string()));
        }
        let decode: DecodeFn<E> = Box::new(move |body: &str| {
            super::deserialize::<P>(P::TYPE, body).map(wrap)
        });
        self.decoders.insert(P::TYPE, decode);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with<P: Payload>(mut self, wrap: fn(P) -> E) -> Result<Self, RegistryError> {
        self.register::<P>(wrap)?;
        Ok(self)
    }

    pub fn decode(&self, payload_type: &str, body: &str) -> Result<E, CodecError> {
        let decode = self
            .decoders
            .get(payload_type)
            .ok_or_else(|| CodecError::UnknownPayloadType(payload_type.to_string()))?;
        decode(body)
    }

    pub fn decode_envelope(&self, envelope: &EventEnvelope) -> Result<E, CodecError> {
        self.decode(envelope.payload_type(), envelope.payload())
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl<E: 'static> Default for PayloadDecoders<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize;
    use crate::codec::tests::{ConsentGranted, UserLoggedIn};

    #[derive(Debug, PartialEq)]
    enum Inbound {
        Login(UserLoggedIn),
        Consent(ConsentGranted),
    }

    fn decoders() -> PayloadDecoders<Inbound> {
        PayloadDecoders::new()
            .with::<UserLoggedIn>(Inbound::Login)
            .unwrap()
            .with::<ConsentGranted>(Inbound::Consent)
            .unwrap()
    }

    #[test]
    fn decodes_each_registered_variant() {
        let decoders = decoders();
        let login = UserLoggedIn {
            user_id: "u-1".into(),
            ip: None,
            attempts: 1,
        };
        let consent = ConsentGranted {
            user_id: "u-1".into(),
            scopes: vec![],
        };

        assert_eq!(
            decoders
                .decode(UserLoggedIn::TYPE, &serialize(&login).unwrap())
                .unwrap(),
            Inbound::Login(login)
        );
        assert_eq!(
            decoders
                .decode(ConsentGranted::TYPE, &serialize(&consent).unwrap())
                .unwrap(),
            Inbound::Consent(consent)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decoders().decode("audit.finding.v1", "{}").unwrap_err();
        assert!(matches!(err, CodecError::UnknownPayloadType(t) if t == "audit.finding.v1"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut decoders = decoders();
        let err = decoders.register::<UserLoggedIn>(Inbound::Login).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateDecoder(_)));
        assert_eq!(
            decoders.registered_types(),
            vec![ConsentGranted::TYPE, UserLoggedIn::TYPE]
        );
    }
}
