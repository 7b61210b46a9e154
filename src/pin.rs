use aes::cipher::{block_padding::NoPadding, BlockDecryptMut};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use cosey::{EcdhEsHkdf256PublicKey, PublicKey};
use hkdf::Hkdf;
use hmac::Mac;
use p256::{
    ecdh::EphemeralSecret, elliptic_curve::sec1::FromEncodedPoint, EncodedPoint,
    PublicKey as P256PublicKey,
};
use rand::{rngs::OsRng, thread_rng, Rng};
use sha2::{Digest, Sha256};
use tracing::{error, instrument};

use crate::proto::ctap2::Ctap2PinUvAuthProtocol;
use crate::transport::error::{Error, PlatformError};

type Aes256CbcEncryptor = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDecryptor = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = hmac::Hmac<Sha256>;

const AES_BLOCK_SIZE: usize = 16;

/// One of the two PIN/UV auth protocol variants. Implementations are
/// stateless: every [`encapsulate`](PinUvAuthProtocol::encapsulate) call
/// generates a fresh ephemeral key agreement key, so a keypair can never be
/// reused across encapsulations.
pub trait PinUvAuthProtocol: Send + Sync {
    fn version(&self) -> Ctap2PinUvAuthProtocol;

    /// encapsulate(peerCoseKey) → (coseKey, sharedSecret) | error
    ///   Generates an encapsulation for the authenticator's public key and
    ///   returns the platform key to transmit and the shared secret.
    fn encapsulate(&self, peer_public_key: &PublicKey) -> Result<(PublicKey, Vec<u8>), Error>;

    /// encrypt(key, demPlaintext) → ciphertext
    ///   The plaintext is restricted to being a multiple of the AES block
    ///   size (16 bytes) in length.
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error>;

    /// decrypt(key, ciphertext) → plaintext | error
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error>;

    /// authenticate(key, message) → signature
    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8>;
}

pub fn new_pin_uv_auth_protocol(version: Ctap2PinUvAuthProtocol) -> Box<dyn PinUvAuthProtocol> {
    match version {
        Ctap2PinUvAuthProtocol::One => Box::new(PinUvAuthProtocolOne::new()),
        Ctap2PinUvAuthProtocol::Two => Box::new(PinUvAuthProtocolTwo::new()),
    }
}

/// ecdh(peerCoseKey) → Z | error, before any KDF is applied.
fn ecdh_raw(peer_public_key: &PublicKey) -> Result<(PublicKey, Vec<u8>), Error> {
    // Parse peerCoseKey and produce a P-256 point. If unsuccessful, or if
    // the resulting point is not on the curve, return error.
    let PublicKey::EcdhEsHkdf256Key(peer_public_key) = peer_public_key else {
        error!("Unsupported peerCoseKey format. Only EcdhEsHkdf256Key is supported.");
        return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
    };
    let encoded_point = EncodedPoint::from_affine_coordinates(
        peer_public_key.x.as_slice().into(),
        peer_public_key.y.as_slice().into(),
        false,
    );
    let Some(peer_public_key): Option<P256PublicKey> =
        P256PublicKey::from_encoded_point(&encoded_point).into()
    else {
        error!("Failed to parse peer public key");
        return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
    };

    // A fresh ephemeral key agreement key on every encapsulation.
    let private_key = EphemeralSecret::random(&mut OsRng);
    let platform_public_key = encode_cose_public_key(&private_key.public_key());

    // Calculate xY, the shared point: the scalar multiplication of the
    // peer's point with the local private key agreement key.
    let shared = private_key.diffie_hellman(&peer_public_key);
    Ok((platform_public_key, shared.raw_secret_bytes().to_vec()))
}

/// getPublicKey(), in COSE_Key form.
fn encode_cose_public_key(public_key: &P256PublicKey) -> PublicKey {
    let point = EncodedPoint::from(public_key);
    let x: heapless::Vec<u8, 32> =
        heapless::Vec::from_slice(point.x().expect("Not the identity point").as_slice())
            .expect("P-256 coordinates are 32 bytes");
    let y: heapless::Vec<u8, 32> =
        heapless::Vec::from_slice(point.y().expect("Not identity nor compressed").as_slice())
            .expect("P-256 coordinates are 32 bytes");
    PublicKey::EcdhEsHkdf256Key(EcdhEsHkdf256PublicKey {
        x: x.into(),
        y: y.into(),
    })
}

#[derive(Debug, Default)]
pub struct PinUvAuthProtocolOne;

impl PinUvAuthProtocolOne {
    pub fn new() -> Self {
        Self
    }

    /// kdf(Z) → sharedSecret
    fn kdf(&self, z: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::default();
        hasher.update(z);
        hasher.finalize().to_vec()
    }
}

impl PinUvAuthProtocol for PinUvAuthProtocolOne {
    fn version(&self) -> Ctap2PinUvAuthProtocol {
        Ctap2PinUvAuthProtocol::One
    }

    #[instrument(skip_all)]
    fn encapsulate(&self, peer_public_key: &PublicKey) -> Result<(PublicKey, Vec<u8>), Error> {
        let (platform_public_key, z) = ecdh_raw(peer_public_key)?;
        Ok((platform_public_key, self.kdf(&z)))
    }

    #[instrument(skip_all)]
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        // AES-256-CBC with an all-zero IV. No padding is performed; the
        // plaintext must be a multiple of the AES block length.
        if plaintext.len() % AES_BLOCK_SIZE != 0 {
            error!(
                { len = plaintext.len() },
                "Plaintext length is not a multiple of AES block length"
            );
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        }
        let iv = [0u8; AES_BLOCK_SIZE];
        let Ok(enc) = Aes256CbcEncryptor::new_from_slices(key, &iv) else {
            error!("Invalid key for AES-256 encryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        };
        Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }

    #[instrument(skip_all)]
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() % AES_BLOCK_SIZE != 0 {
            error!(
                { len = ciphertext.len() },
                "Ciphertext length is not a multiple of AES block length"
            );
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        }
        let iv = [0u8; AES_BLOCK_SIZE];
        let Ok(dec) = Aes256CbcDecryptor::new_from_slices(key, &iv) else {
            error!("Invalid key for AES-256 decryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        };
        let Ok(plaintext) = dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext) else {
            error!("Unpad error while decrypting");
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        };
        Ok(plaintext)
    }

    #[instrument(skip_all)]
    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        // The first 16 bytes of HMAC-SHA-256 over the message.
        let hmac = hmac_sha256(key, message);
        Vec::from(&hmac[..16])
    }
}

#[derive(Debug, Default)]
pub struct PinUvAuthProtocolTwo;

impl PinUvAuthProtocolTwo {
    pub fn new() -> Self {
        Self
    }

    /// kdf(Z) → sharedSecret
    fn kdf(&self, z: &[u8]) -> Vec<u8> {
        // HKDF-SHA-256(salt = 32 zero bytes, IKM = Z, L = 32, info = "CTAP2 HMAC key") ||
        // HKDF-SHA-256(salt = 32 zero bytes, IKM = Z, L = 32, info = "CTAP2 AES key")
        let salt = [0u8; 32];
        let mut output = hkdf_sha256(Some(&salt), z, "CTAP2 HMAC key".as_bytes());
        output.extend(hkdf_sha256(Some(&salt), z, "CTAP2 AES key".as_bytes()));
        output
    }
}

impl PinUvAuthProtocol for PinUvAuthProtocolTwo {
    fn version(&self) -> Ctap2PinUvAuthProtocol {
        Ctap2PinUvAuthProtocol::Two
    }

    #[instrument(skip_all)]
    fn encapsulate(&self, peer_public_key: &PublicKey) -> Result<(PublicKey, Vec<u8>), Error> {
        let (platform_public_key, z) = ecdh_raw(peer_public_key)?;
        Ok((platform_public_key, self.kdf(&z)))
    }

    #[instrument(skip_all)]
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        if plaintext.len() % AES_BLOCK_SIZE != 0 {
            error!(
                { len = plaintext.len() },
                "Plaintext length is not a multiple of AES block length"
            );
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        }

        // Discard the first 32 bytes of key, selecting the AES-key portion
        // of the shared secret.
        if key.len() < 64 {
            error!("Invalid key length for protocol two encryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        }
        let key = &key[32..64];

        // A random IV, transmitted ahead of the ciphertext.
        let iv: [u8; AES_BLOCK_SIZE] = thread_rng().gen();
        let Ok(enc) = Aes256CbcEncryptor::new_from_slices(key, &iv) else {
            error!("Invalid key for AES-256 encryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        };
        let ct = enc.encrypt_padded_vec_mut::<NoPadding>(plaintext);

        let mut out = Vec::from(iv);
        out.extend(ct);
        Ok(out)
    }

    #[instrument(skip_all)]
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if key.len() < 64 {
            error!("Invalid key length for protocol two decryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        }
        let key = &key[32..64];

        // Split off the IV transmitted ahead of the ciphertext.
        if ciphertext.len() < AES_BLOCK_SIZE
            || (ciphertext.len() - AES_BLOCK_SIZE) % AES_BLOCK_SIZE != 0
        {
            error!({ len = ciphertext.len() }, "Invalid length for ciphertext");
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        }
        let (iv, ciphertext) = ciphertext.split_at(AES_BLOCK_SIZE);

        let Ok(dec) = Aes256CbcDecryptor::new_from_slices(key, iv) else {
            error!("Invalid key for AES-256 decryption");
            return Err(Error::Ctap(crate::proto::CtapError::Other));
        };
        let Ok(plaintext) = dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext) else {
            error!("Unpad error while decrypting");
            return Err(Error::Platform(PlatformError::InvalidBlockLength));
        };
        Ok(plaintext)
    }

    #[instrument(skip_all)]
    fn authenticate(&self, key: &[u8], message: &[u8]) -> Vec<u8> {
        // If key is longer than 32 bytes, discard the excess, selecting the
        // HMAC-key portion of the shared secret. When key is the
        // pinUvAuthToken it is exactly 32 bytes long.
        let key = &key[..key.len().min(32)];
        hmac_sha256(key, message)
    }
}

/// hash(pin) → LEFT(SHA-256(pin), 16). PIN material only ever leaves the
/// platform in this hashed-and-truncated form, encrypted.
pub fn pin_hash(pin: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::default();
    hasher.update(pin);
    let hashed = hasher.finalize().to_vec();
    Vec::from(&hashed[..16])
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut hmac = HmacSha256::new_from_slice(key).expect("Any key size is valid");
    hmac.update(message);
    hmac.finalize().into_bytes().to_vec()
}

pub fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; 32]; // fixed L = 32
    hk.expand(info, &mut okm)
        .expect("32 is a valid length for Sha256 to output");
    Vec::from(okm)
}

#[cfg(test)]
mod tests {
    use p256::ecdh::EphemeralSecret;
    use p256::elliptic_curve::sec1::FromEncodedPoint;
    use rand::rngs::OsRng;

    use super::{
        encode_cose_public_key, pin_hash, PinUvAuthProtocol, PinUvAuthProtocolOne,
        PinUvAuthProtocolTwo,
    };

    fn authenticator_keypair() -> (EphemeralSecret, cosey::PublicKey) {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = encode_cose_public_key(&secret.public_key());
        (secret, public)
    }

    #[test]
    fn kdf_is_deterministic() {
        let z = [0x42u8; 32];
        assert_eq!(PinUvAuthProtocolOne::new().kdf(&z), PinUvAuthProtocolOne::new().kdf(&z));
        assert_eq!(PinUvAuthProtocolTwo::new().kdf(&z), PinUvAuthProtocolTwo::new().kdf(&z));
    }

    #[test]
    fn kdf_outputs_diverge_between_protocols() {
        let z = [0x42u8; 32];
        let one = PinUvAuthProtocolOne::new().kdf(&z);
        let two = PinUvAuthProtocolTwo::new().kdf(&z);
        assert_eq!(one.len(), 32);
        assert_eq!(two.len(), 64);
        assert_ne!(one, two[..32]);
        assert_ne!(one, two[32..]);
    }

    fn cose_x_coordinate(key: cosey::PublicKey) -> Vec<u8> {
        match key {
            cosey::PublicKey::EcdhEsHkdf256Key(key) => key.x.to_vec(),
            _ => panic!("Unexpected COSE key type"),
        }
    }

    #[test]
    fn encapsulate_generates_fresh_keypairs() {
        let (_, peer_public) = authenticator_keypair();
        let protocol = PinUvAuthProtocolOne::new();
        let (platform_a, _) = protocol.encapsulate(&peer_public).unwrap();
        let (platform_b, _) = protocol.encapsulate(&peer_public).unwrap();
        assert_ne!(cose_x_coordinate(platform_a), cose_x_coordinate(platform_b));
    }

    #[test]
    fn encapsulate_agrees_with_peer() {
        for protocol in [
            Box::new(PinUvAuthProtocolOne::new()) as Box<dyn PinUvAuthProtocol>,
            Box::new(PinUvAuthProtocolTwo::new()),
        ] {
            let (peer_secret, peer_public) = authenticator_keypair();
            let (platform_public, shared_secret) = protocol.encapsulate(&peer_public).unwrap();

            // The authenticator's side of the same agreement.
            let cosey::PublicKey::EcdhEsHkdf256Key(platform_public) = platform_public else {
                panic!("Unexpected COSE key type");
            };
            let point = p256::EncodedPoint::from_affine_coordinates(
                platform_public.x.as_slice().into(),
                platform_public.y.as_slice().into(),
                false,
            );
            let platform_point: p256::PublicKey =
                Option::from(p256::PublicKey::from_encoded_point(&point)).unwrap();
            let z = peer_secret.diffie_hellman(&platform_point);
            let peer_derived = match protocol.version() {
                crate::proto::ctap2::Ctap2PinUvAuthProtocol::One => {
                    PinUvAuthProtocolOne::new().kdf(z.raw_secret_bytes().as_slice())
                }
                crate::proto::ctap2::Ctap2PinUvAuthProtocol::Two => {
                    PinUvAuthProtocolTwo::new().kdf(z.raw_secret_bytes().as_slice())
                }
            };
            assert_eq!(shared_secret, peer_derived);
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip_block_aligned() {
        let key_one = vec![0x11u8; 32];
        let key_two = vec![0x22u8; 64];
        for len in [16, 32, 64] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let one = PinUvAuthProtocolOne::new();
            let ciphertext = one.encrypt(&key_one, &plaintext).unwrap();
            assert_eq!(ciphertext.len(), len);
            assert_eq!(one.decrypt(&key_one, &ciphertext).unwrap(), plaintext);

            let two = PinUvAuthProtocolTwo::new();
            let ciphertext = two.encrypt(&key_two, &plaintext).unwrap();
            assert_eq!(ciphertext.len(), len + 16); // random IV prepended
            assert_eq!(two.decrypt(&key_two, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn encrypt_rejects_unaligned_plaintext() {
        let plaintext = vec![0u8; 15];
        assert!(PinUvAuthProtocolOne::new()
            .encrypt(&[0x11; 32], &plaintext)
            .is_err());
        assert!(PinUvAuthProtocolTwo::new()
            .encrypt(&[0x22; 64], &plaintext)
            .is_err());
    }

    #[test]
    fn decrypt_rejects_unaligned_ciphertext() {
        assert!(PinUvAuthProtocolOne::new()
            .decrypt(&[0x11; 32], &[0u8; 17])
            .is_err());
        // Protocol two: shorter than its IV alone.
        assert!(PinUvAuthProtocolTwo::new()
            .decrypt(&[0x22; 64], &[0u8; 15])
            .is_err());
        assert!(PinUvAuthProtocolTwo::new()
            .decrypt(&[0x22; 64], &[0u8; 31])
            .is_err());
    }

    #[test]
    fn authenticate_tag_lengths() {
        let key = [0x33u8; 32];
        let message = b"example message";
        assert_eq!(
            PinUvAuthProtocolOne::new().authenticate(&key, message).len(),
            16
        );
        assert_eq!(
            PinUvAuthProtocolTwo::new().authenticate(&key, message).len(),
            32
        );
    }

    #[test]
    fn pin_hash_is_truncated_sha256() {
        let hash = pin_hash(b"1234");
        assert_eq!(hash.len(), 16);
        assert_eq!(hash, pin_hash(b"1234"));
        assert_ne!(hash, pin_hash(b"4321"));
    }
}
