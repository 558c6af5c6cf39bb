//! Private key generation and inspection.

use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;

use crate::api::ca::KeyType;
use crate::commons::{CaResult, Error};


/// Checks that the key type and size are supported.
pub fn validate_key_type_and_bits(key_type: KeyType, bits: u32) -> CaResult<()> {
    let supported = match key_type {
        KeyType::Ec => matches!(bits, 224 | 256 | 384 | 521),
        KeyType::Rsa => matches!(bits, 2048 | 3072 | 4096),
    };
    if supported {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "unsupported private key: {key_type} with {bits} bits"
        )))
    }
}

pub fn generate_private_key(
    key_type: KeyType,
    bits: u32,
) -> CaResult<PKey<Private>> {
    validate_key_type_and_bits(key_type, bits)?;
    match key_type {
        KeyType::Ec => {
            let group = EcGroup::from_curve_name(curve(bits))?;
            Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
        }
        KeyType::Rsa => Ok(PKey::from_rsa(Rsa::generate(bits)?)?),
    }
}

fn curve(bits: u32) -> Nid {
    match bits {
        224 => Nid::SECP224R1,
        384 => Nid::SECP384R1,
        521 => Nid::SECP521R1,
        _ => Nid::X9_62_PRIME256V1,
    }
}

/// Returns the type and size of a (public or private) key.
pub fn key_type_and_bits<T: HasPublic>(
    key: &PKeyRef<T>,
) -> CaResult<(KeyType, u32)> {
    match key.id() {
        Id::EC => Ok((KeyType::Ec, key.bits())),
        Id::RSA => Ok((KeyType::Rsa, key.bits())),
        other => Err(Error::validation(format!(
            "unsupported key algorithm: {other:?}"
        ))),
    }
}

pub fn parse_private_key(pem: &str) -> CaResult<PKey<Private>> {
    if pem.trim().is_empty() {
        return Err(Error::validation("empty private key"));
    }
    PKey::private_key_from_pem(pem.as_bytes())
        .map_err(|e| Error::validation(format!("invalid private key: {e}")))
}

pub fn private_key_to_pem(key: &PKeyRef<Private>) -> CaResult<String> {
    String::from_utf8(key.private_key_to_pem_pkcs8()?).map_err(Error::custom)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_supported_keys() {
        for (key_type, bits) in [
            (KeyType::Ec, 224),
            (KeyType::Ec, 256),
            (KeyType::Ec, 384),
            (KeyType::Ec, 521),
            (KeyType::Rsa, 2048),
        ] {
            let key = generate_private_key(key_type, bits).unwrap();
            assert_eq!(key_type_and_bits(&key).unwrap(), (key_type, bits));

            let pem = private_key_to_pem(&key).unwrap();
            let parsed = parse_private_key(&pem).unwrap();
            assert!(parsed.public_eq(&key));
        }
    }

    #[test]
    fn reject_unsupported_keys() {
        assert!(generate_private_key(KeyType::Ec, 512).is_err());
        assert!(generate_private_key(KeyType::Rsa, 1024).is_err());
        assert!(parse_private_key("garbage").is_err());
    }
}
