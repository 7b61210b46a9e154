//! In-process virtual authenticator used by the integration tests. It
//! speaks real CTAPHID framing and performs its own side of the PIN/UV
//! key agreement, so the full stack is exercised end to end.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::FromEncodedPoint;
use p256::{EncodedPoint, PublicKey as P256PublicKey};
use rand::rngs::OsRng;
use serde_cbor::Value;
use sha2::{Digest, Sha256};

use libctap2::pin::{hmac_sha256, pin_hash, PinUvAuthProtocol, PinUvAuthProtocolOne};
use libctap2::transport::device::{HidDeviceIo, ReportLayout};
use libctap2::transport::error::{Error, TransportError};
use libctap2::transport::hid::framing::{
    HidCommand, HidMessage, HidMessageParser, HidMessageParserState,
};

pub const RP_ID: &str = "example.org";
pub const TOKEN: [u8; 32] = [0x5A; 32];
pub const CRED_ID: [u8; 8] = [0xC4; 8];
pub const HMAC_CRED_KEY: [u8; 32] = [0xEE; 32];

const CHANNEL_ID: u32 = 0x1122_3344;
const PACKET_SIZE: usize = 64;
const AAGUID: [u8; 16] = [0xAB; 16];

#[derive(Clone)]
pub struct VirtualConfig {
    pub versions: Vec<&'static str>,
    pub extensions: Vec<&'static str>,
    pub options: Vec<(&'static str, bool)>,
    pub pin_protocols: Vec<u32>,
    pub pin: Option<String>,
    pub total_credentials: u32,
    pub keepalives_before_reply: u32,
    /// Reply to PING with a CTAPHID_ERROR carrying this code.
    pub error_on_ping: Option<u8>,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            versions: vec!["FIDO_2_0", "FIDO_2_1"],
            extensions: vec!["hmac-secret", "hmac-secret-mc", "credBlob"],
            options: vec![("rk", true), ("up", true), ("makeCredUvNotRqd", true)],
            pin_protocols: vec![1],
            pin: None,
            total_credentials: 1,
            keepalives_before_reply: 0,
            error_on_ping: None,
        }
    }
}

/// What the authenticator observed, shared with the test body.
#[derive(Default)]
pub struct Telemetry {
    /// CTAP2 command bytes, in arrival order.
    pub cbor_commands: Vec<u8>,
    /// Length of the most recently decrypted hmac-secret salt payload.
    pub last_salt_len: Option<usize>,
}

pub struct VirtualDevice {
    config: VirtualConfig,
    telemetry: Arc<Mutex<Telemetry>>,
    layout: ReportLayout,
    outgoing: VecDeque<Vec<u8>>,
    parser: HidMessageParser,
    key_secret: Option<EphemeralSecret>,
    current_pin: Option<String>,
    pending_assertions: u32,
    assertion_hmac_output: Option<Vec<u8>>,
}

impl VirtualDevice {
    pub fn new(config: VirtualConfig) -> (Self, Arc<Mutex<Telemetry>>) {
        let telemetry = Arc::new(Mutex::new(Telemetry::default()));
        let current_pin = config.pin.clone();
        (
            Self {
                config,
                telemetry: telemetry.clone(),
                layout: ReportLayout::default(),
                outgoing: VecDeque::new(),
                parser: HidMessageParser::new(),
                key_secret: None,
                current_pin,
                pending_assertions: 0,
                assertion_hmac_output: None,
            },
            telemetry,
        )
    }

    fn enqueue(&mut self, message: &HidMessage) {
        for packet in message.packets(PACKET_SIZE).unwrap() {
            let mut report = packet;
            report.resize(PACKET_SIZE, 0);
            self.outgoing.push_back(report);
        }
    }

    fn handle_message(&mut self, message: HidMessage) {
        match message.cmd {
            HidCommand::Init => {
                let mut payload = message.payload[..8].to_vec();
                payload.extend(CHANNEL_ID.to_be_bytes());
                payload.extend([0x02, 0x01, 0x00, 0x00, 0x05]); // version, caps: WINK | CBOR
                self.enqueue(&HidMessage::broadcast(HidCommand::Init, &payload));
            }
            HidCommand::Ping => {
                if let Some(code) = self.config.error_on_ping {
                    self.enqueue(&HidMessage::new(CHANNEL_ID, HidCommand::Error, &[code]));
                } else {
                    self.enqueue(&HidMessage::new(
                        CHANNEL_ID,
                        HidCommand::Ping,
                        &message.payload,
                    ));
                }
            }
            HidCommand::Wink => {
                self.enqueue(&HidMessage::new(CHANNEL_ID, HidCommand::Wink, &[]));
            }
            HidCommand::Cbor => {
                let response = self.handle_cbor(&message.payload);
                for _ in 0..self.config.keepalives_before_reply {
                    self.enqueue(&HidMessage::new(CHANNEL_ID, HidCommand::KeepAlive, &[0x02]));
                }
                self.enqueue(&HidMessage::new(CHANNEL_ID, HidCommand::Cbor, &response));
            }
            HidCommand::Cancel => {}
            _ => {}
        }
    }

    fn handle_cbor(&mut self, payload: &[u8]) -> Vec<u8> {
        let command = payload[0];
        self.telemetry.lock().unwrap().cbor_commands.push(command);
        match command {
            0x01 => self.handle_make_credential(&payload[1..]),
            0x02 => self.handle_get_assertion(&payload[1..]),
            0x04 => self.handle_get_info(),
            0x06 => self.handle_client_pin(&payload[1..]),
            0x08 => self.handle_get_next_assertion(),
            _ => vec![0x01], // CTAP1_ERR_INVALID_COMMAND
        }
    }

    fn handle_get_info(&self) -> Vec<u8> {
        let mut map = BTreeMap::new();
        map.insert(
            Value::Integer(1),
            Value::Array(
                self.config
                    .versions
                    .iter()
                    .map(|v| Value::Text(v.to_string()))
                    .collect(),
            ),
        );
        map.insert(
            Value::Integer(2),
            Value::Array(
                self.config
                    .extensions
                    .iter()
                    .map(|e| Value::Text(e.to_string()))
                    .collect(),
            ),
        );
        map.insert(Value::Integer(3), Value::Bytes(AAGUID.to_vec()));
        let options: BTreeMap<Value, Value> = self
            .config
            .options
            .iter()
            .map(|(name, value)| (Value::Text(name.to_string()), Value::Bool(*value)))
            .collect();
        map.insert(Value::Integer(4), Value::Map(options));
        map.insert(Value::Integer(5), Value::Integer(1200));
        map.insert(
            Value::Integer(6),
            Value::Array(
                self.config
                    .pin_protocols
                    .iter()
                    .map(|p| Value::Integer(*p as i128))
                    .collect(),
            ),
        );
        ok_body(map)
    }

    fn handle_make_credential(&mut self, body: &[u8]) -> Vec<u8> {
        let Ok(Value::Map(request)) = serde_cbor::from_slice(body) else {
            return vec![0x12]; // CTAP2_ERR_INVALID_CBOR
        };

        let uv_not_required = self
            .config
            .options
            .iter()
            .any(|(name, value)| *name == "makeCredUvNotRqd" && *value);
        let auth_param = request.get(&Value::Integer(8));
        if !uv_not_required && auth_param.is_none() {
            return vec![0x36]; // CTAP2_ERR_PUAT_REQUIRED
        }
        if let Some(Value::Bytes(param)) = auth_param {
            let Some(Value::Bytes(hash)) = request.get(&Value::Integer(1)) else {
                return vec![0x14];
            };
            let expected = PinUvAuthProtocolOne::new().authenticate(&TOKEN, hash);
            if param != &expected {
                return vec![0x33]; // CTAP2_ERR_PIN_AUTH_INVALID
            }
        }

        let mut extension_outputs = BTreeMap::new();
        if let Some(Value::Map(extensions)) = request.get(&Value::Integer(6)) {
            if let Some(Value::Bool(true)) = extensions.get(&Value::Text("hmac-secret".into())) {
                extension_outputs
                    .insert(Value::Text("hmac-secret".into()), Value::Bool(true));
            }
            if let Some(Value::Map(hmac_input)) =
                extensions.get(&Value::Text("hmac-secret-mc".into()))
            {
                match self.process_hmac_input(hmac_input) {
                    Ok(output) => {
                        extension_outputs.insert(
                            Value::Text("hmac-secret-mc".into()),
                            Value::Bytes(output),
                        );
                    }
                    Err(status) => return vec![status],
                }
            }
            if let Some(Value::Bytes(_)) = extensions.get(&Value::Text("credBlob".into())) {
                extension_outputs.insert(Value::Text("credBlob".into()), Value::Bool(true));
            }
        }

        let auth_data = build_auth_data(true, &extension_outputs);

        let mut attestation = BTreeMap::new();
        attestation.insert(Value::Text("alg".into()), Value::Integer(-7));
        attestation.insert(Value::Text("sig".into()), Value::Bytes(vec![0x30; 70]));

        let mut map = BTreeMap::new();
        map.insert(Value::Integer(1), Value::Text("packed".into()));
        map.insert(Value::Integer(2), Value::Bytes(auth_data));
        map.insert(Value::Integer(3), Value::Map(attestation));
        ok_body(map)
    }

    fn handle_get_assertion(&mut self, body: &[u8]) -> Vec<u8> {
        let Ok(Value::Map(request)) = serde_cbor::from_slice(body) else {
            return vec![0x12];
        };

        self.assertion_hmac_output = None;
        if let Some(Value::Map(extensions)) = request.get(&Value::Integer(4)) {
            if let Some(Value::Map(hmac_input)) =
                extensions.get(&Value::Text("hmac-secret".into()))
            {
                match self.process_hmac_input(hmac_input) {
                    Ok(output) => self.assertion_hmac_output = Some(output),
                    Err(status) => return vec![status],
                }
            }
        }

        self.pending_assertions = self.config.total_credentials.saturating_sub(1);
        self.assertion_response(Some(self.config.total_credentials))
    }

    fn handle_get_next_assertion(&mut self) -> Vec<u8> {
        if self.pending_assertions == 0 {
            return vec![0x30]; // CTAP2_ERR_NOT_ALLOWED
        }
        self.pending_assertions -= 1;
        self.assertion_response(None)
    }

    fn assertion_response(&self, count: Option<u32>) -> Vec<u8> {
        let mut extension_outputs = BTreeMap::new();
        if let Some(output) = &self.assertion_hmac_output {
            extension_outputs.insert(
                Value::Text("hmac-secret".into()),
                Value::Bytes(output.clone()),
            );
        }
        let auth_data = build_auth_data(false, &extension_outputs);

        let mut credential = BTreeMap::new();
        credential.insert(Value::Text("type".into()), Value::Text("public-key".into()));
        credential.insert(Value::Text("id".into()), Value::Bytes(CRED_ID.to_vec()));

        let mut map = BTreeMap::new();
        map.insert(Value::Integer(1), Value::Map(credential));
        map.insert(Value::Integer(2), Value::Bytes(auth_data));
        map.insert(Value::Integer(3), Value::Bytes(vec![0x51; 72]));
        if let Some(count) = count {
            map.insert(Value::Integer(5), Value::Integer(count as i128));
        }
        ok_body(map)
    }

    fn handle_client_pin(&mut self, body: &[u8]) -> Vec<u8> {
        let Ok(Value::Map(request)) = serde_cbor::from_slice(body) else {
            return vec![0x12];
        };
        let Some(Value::Integer(subcommand)) = request.get(&Value::Integer(2)) else {
            return vec![0x14]; // CTAP2_ERR_MISSING_PARAMETER
        };

        match *subcommand {
            // getPINRetries
            0x01 => {
                let mut map = BTreeMap::new();
                map.insert(Value::Integer(3), Value::Integer(8));
                ok_body(map)
            }
            // getKeyAgreement
            0x02 => {
                let secret = EphemeralSecret::random(&mut OsRng);
                let point = EncodedPoint::from(secret.public_key());
                let response = key_agreement_body(
                    point.x().unwrap().as_slice(),
                    point.y().unwrap().as_slice(),
                );
                self.key_secret = Some(secret);
                response
            }
            // setPIN
            0x03 => {
                let Some(Value::Map(platform_key)) = request.get(&Value::Integer(3)) else {
                    return vec![0x14];
                };
                let (Some(Value::Bytes(auth_param)), Some(Value::Bytes(new_pin_enc))) = (
                    request.get(&Value::Integer(4)),
                    request.get(&Value::Integer(5)),
                ) else {
                    return vec![0x14];
                };
                let Ok(shared_secret) = self.shared_secret(platform_key) else {
                    return vec![0x12];
                };
                let protocol = PinUvAuthProtocolOne::new();
                if auth_param != &protocol.authenticate(&shared_secret, new_pin_enc) {
                    return vec![0x33]; // CTAP2_ERR_PIN_AUTH_INVALID
                }
                let Ok(padded) = protocol.decrypt(&shared_secret, new_pin_enc) else {
                    return vec![0x12];
                };
                self.current_pin = Some(unpad_pin(&padded));
                ok_empty()
            }
            // changePIN
            0x04 => {
                let Some(Value::Map(platform_key)) = request.get(&Value::Integer(3)) else {
                    return vec![0x14];
                };
                let (
                    Some(Value::Bytes(auth_param)),
                    Some(Value::Bytes(new_pin_enc)),
                    Some(Value::Bytes(pin_hash_enc)),
                ) = (
                    request.get(&Value::Integer(4)),
                    request.get(&Value::Integer(5)),
                    request.get(&Value::Integer(6)),
                ) else {
                    return vec![0x14];
                };
                let Ok(shared_secret) = self.shared_secret(platform_key) else {
                    return vec![0x12];
                };
                let protocol = PinUvAuthProtocolOne::new();
                let signed = [new_pin_enc.as_slice(), pin_hash_enc.as_slice()].concat();
                if auth_param != &protocol.authenticate(&shared_secret, &signed) {
                    return vec![0x33];
                }
                match self.verify_pin_hash(&protocol, &shared_secret, pin_hash_enc) {
                    Ok(()) => {}
                    Err(status) => return vec![status],
                }
                let Ok(padded) = protocol.decrypt(&shared_secret, new_pin_enc) else {
                    return vec![0x12];
                };
                self.current_pin = Some(unpad_pin(&padded));
                ok_empty()
            }
            // getPinToken, getPinUvAuthTokenUsingPinWithPermissions
            0x05 | 0x09 => {
                let Some(Value::Map(platform_key)) = request.get(&Value::Integer(3)) else {
                    return vec![0x14];
                };
                let Some(Value::Bytes(pin_hash_enc)) = request.get(&Value::Integer(6)) else {
                    return vec![0x14];
                };
                let Ok(shared_secret) = self.shared_secret(platform_key) else {
                    return vec![0x12];
                };
                let protocol = PinUvAuthProtocolOne::new();
                match self.verify_pin_hash(&protocol, &shared_secret, pin_hash_enc) {
                    Ok(()) => {}
                    Err(status) => return vec![status],
                }
                let encrypted_token = protocol.encrypt(&shared_secret, &TOKEN).unwrap();
                let mut map = BTreeMap::new();
                map.insert(Value::Integer(2), Value::Bytes(encrypted_token));
                ok_body(map)
            }
            _ => vec![0x3E], // CTAP2_ERR_INVALID_SUBCOMMAND
        }
    }

    fn verify_pin_hash(
        &self,
        protocol: &PinUvAuthProtocolOne,
        shared_secret: &[u8],
        pin_hash_enc: &[u8],
    ) -> Result<(), u8> {
        let received_hash = protocol
            .decrypt(shared_secret, pin_hash_enc)
            .map_err(|_| 0x12u8)?;
        let Some(pin) = &self.current_pin else {
            return Err(0x35); // CTAP2_ERR_PIN_NOT_SET
        };
        if received_hash != pin_hash(pin.as_bytes()) {
            return Err(0x31); // CTAP2_ERR_PIN_INVALID
        }
        Ok(())
    }

    /// Decrypts the platform's salts, records their length, and returns
    /// the encrypted per-credential outputs.
    fn process_hmac_input(&mut self, input: &BTreeMap<Value, Value>) -> Result<Vec<u8>, u8> {
        let Some(Value::Map(platform_key)) = input.get(&Value::Integer(1)) else {
            return Err(0x14);
        };
        let Some(Value::Bytes(salt_enc)) = input.get(&Value::Integer(2)) else {
            return Err(0x14);
        };
        let shared_secret = self.shared_secret(platform_key).map_err(|_| 0x12u8)?;
        let protocol = PinUvAuthProtocolOne::new();
        let salts = protocol.decrypt(&shared_secret, salt_enc).map_err(|_| 0x12u8)?;
        if salts.len() != 32 && salts.len() != 64 {
            return Err(0x03); // CTAP1_ERR_INVALID_LENGTH
        }
        self.telemetry.lock().unwrap().last_salt_len = Some(salts.len());

        let mut output = hmac_sha256(&HMAC_CRED_KEY, &salts[..32]);
        if salts.len() == 64 {
            output.extend(hmac_sha256(&HMAC_CRED_KEY, &salts[32..]));
        }
        protocol.encrypt(&shared_secret, &output).map_err(|_| 0x12u8)
    }

    /// The authenticator's side of the protocol-one key agreement.
    fn shared_secret(&self, platform_key: &BTreeMap<Value, Value>) -> Result<Vec<u8>, ()> {
        let Some(Value::Bytes(x)) = platform_key.get(&Value::Integer(-2)) else {
            return Err(());
        };
        let Some(Value::Bytes(y)) = platform_key.get(&Value::Integer(-3)) else {
            return Err(());
        };
        let point = EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        );
        let Some(public_key): Option<P256PublicKey> =
            P256PublicKey::from_encoded_point(&point).into()
        else {
            return Err(());
        };
        let secret = self.key_secret.as_ref().ok_or(())?;
        let z = secret.diffie_hellman(&public_key);
        let mut hasher = Sha256::default();
        hasher.update(z.raw_secret_bytes());
        Ok(hasher.finalize().to_vec())
    }
}

impl HidDeviceIo for VirtualDevice {
    fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    fn get_input_report(&mut self, _timeout: Duration) -> Result<(u8, Vec<u8>), Error> {
        self.outgoing
            .pop_front()
            .map(|report| (0, report))
            .ok_or(Error::Transport(TransportError::Timeout))
    }

    fn set_output_report(&mut self, _report_id: u8, data: &[u8]) -> Result<usize, Error> {
        if let HidMessageParserState::Done = self.parser.update(data)? {
            let message = self.parser.message()?;
            self.parser = HidMessageParser::new();
            self.handle_message(message);
        }
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

fn ok_body(map: BTreeMap<Value, Value>) -> Vec<u8> {
    let mut out = vec![0x00];
    out.extend(serde_cbor::to_vec(&Value::Map(map)).unwrap());
    out
}

fn ok_empty() -> Vec<u8> {
    vec![0x00]
}

fn unpad_pin(padded: &[u8]) -> String {
    let end = padded
        .iter()
        .position(|&b| b == 0x00)
        .unwrap_or(padded.len());
    String::from_utf8_lossy(&padded[..end]).to_string()
}

/// ClientPIN keyAgreement response. The COSE key is spliced in manually so
/// it keeps the canonical CTAP2 label order, which a BTreeMap-backed Value
/// would not preserve.
fn key_agreement_body(x: &[u8], y: &[u8]) -> Vec<u8> {
    let mut cose = vec![0xA5]; // map(5)
    cose.extend([0x01, 0x02]); // 1 (kty): 2 (EC2)
    cose.extend([0x03, 0x38, 0x18]); // 3 (alg): -25 (ECDH-ES+HKDF-256)
    cose.extend([0x20, 0x01]); // -1 (crv): 1 (P-256)
    cose.extend([0x21, 0x58, 0x20]); // -2 (x): bytes(32)
    cose.extend(x);
    cose.extend([0x22, 0x58, 0x20]); // -3 (y): bytes(32)
    cose.extend(y);

    let mut out = vec![0x00, 0xA1, 0x01]; // status, map(1), key 1
    out.extend(cose);
    out
}

fn build_auth_data(include_attested: bool, extensions: &BTreeMap<Value, Value>) -> Vec<u8> {
    let mut hasher = Sha256::default();
    hasher.update(RP_ID.as_bytes());
    let mut data = hasher.finalize().to_vec();

    let mut flags = 0x01; // UP
    if include_attested {
        flags |= 0x40;
    }
    if !extensions.is_empty() {
        flags |= 0x80;
    }
    data.push(flags);
    data.extend([0x00, 0x00, 0x00, 0x01]); // signCount

    if include_attested {
        data.extend(AAGUID);
        data.extend((CRED_ID.len() as u16).to_be_bytes());
        data.extend(CRED_ID);

        let mut cose = BTreeMap::new();
        cose.insert(Value::Integer(1), Value::Integer(2));
        cose.insert(Value::Integer(3), Value::Integer(-7));
        cose.insert(Value::Integer(-1), Value::Integer(1));
        cose.insert(Value::Integer(-2), Value::Bytes(vec![0xAA; 32]));
        cose.insert(Value::Integer(-3), Value::Bytes(vec![0xBB; 32]));
        data.extend(serde_cbor::to_vec(&Value::Map(cose)).unwrap());
    }

    if !extensions.is_empty() {
        data.extend(serde_cbor::to_vec(&Value::Map(extensions.clone())).unwrap());
    }
    data
}
