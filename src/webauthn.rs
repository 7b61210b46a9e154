use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::ops::webauthn::{
    Assertion, CreateExtensionInputs, CreateExtensionOutputs, CredentialPropertiesOutput,
    GetAssertionRequest, GetExtensionInputs, GetExtensionOutputs, HmacGetSecretInput,
    HmacGetSecretOutput, MakeCredentialRequest, MakeCredentialResponse, PrfOutput, PrfValues,
};
use crate::pin::{new_pin_uv_auth_protocol, pin_hash, PinUvAuthProtocol};
use crate::proto::ctap2::{
    EXTENSION_CRED_BLOB, EXTENSION_CRED_PROTECT, EXTENSION_HMAC_SECRET, EXTENSION_HMAC_SECRET_MC,
    EXTENSION_MIN_PIN_LENGTH, EXTENSION_PIN_COMPLEXITY_POLICY, EXTENSION_THIRD_PARTY_PAYMENT,
};
use crate::proto::ctap2::{
    AuthenticatorData, Ctap2, Ctap2AuthTokenPermissionRole, Ctap2ClientPinRequest,
    Ctap2CredBlobOutput, Ctap2CredentialProtectionPolicy, Ctap2GetAssertionExtensions,
    Ctap2GetAssertionOptions, Ctap2GetAssertionRequest, Ctap2GetAssertionResponse,
    Ctap2GetInfoResponse, Ctap2HmacSecretInput, Ctap2HmacSecretOutput,
    Ctap2MakeCredentialExtensions, Ctap2MakeCredentialOptions, Ctap2MakeCredentialRequest,
    Ctap2PinUvAuthProtocol, Ctap2UserVerifiableRequest,
};
use crate::transport::device::{DeviceDescriptor, HidBackend, FIDO_USAGE_PAGE};
use crate::transport::error::{Error, PlatformError, TransportError};
use crate::transport::hid::HidChannel;
use crate::transport::Channel;

const HMAC_SECRET_SALT_LEN: usize = 32;

/// A FIDO2 device session. Owns one logical channel to the authenticator
/// and the per-session state (cached capability snapshot, negotiated
/// PIN/UV auth protocol). All public operations acquire an internal lock
/// for their whole duration; operations on the same device never
/// interleave.
pub struct Device<C: Channel> {
    info: Ctap2GetInfoResponse,
    session: Mutex<Session<C>>,
}

struct Session<C: Channel> {
    channel: C,
    pin_uv_proto: Option<Ctap2PinUvAuthProtocol>,
}

/// Encapsulation state kept across one request/response exchange, used to
/// decrypt extension outputs. Never reused for another exchange.
struct ExtensionCrypto {
    protocol: Box<dyn PinUvAuthProtocol>,
    shared_secret: Vec<u8>,
}

impl ExtensionCrypto {
    fn decrypt_salts(&self, encrypted: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>), Error> {
        let salt = self.protocol.decrypt(&self.shared_secret, encrypted)?;
        match salt.len() {
            32 => Ok((salt, None)),
            64 => Ok((salt[..32].to_vec(), Some(salt[32..].to_vec()))),
            len => {
                warn!({ len }, "Returned salt must be 32 or 64 bytes");
                Err(Error::Platform(PlatformError::InvalidSaltSize))
            }
        }
    }
}

impl Device<HidChannel> {
    /// Opens a FIDO2 device: acquires the HID handle, initializes a
    /// CTAPHID channel, and fetches the capability snapshot.
    #[instrument(skip_all, fields(dev = %descriptor))]
    pub fn open(backend: &dyn HidBackend, descriptor: &DeviceDescriptor) -> Result<Self, Error> {
        if descriptor.report.usage_page != FIDO_USAGE_PAGE {
            warn!(
                { usage_page = descriptor.report.usage_page },
                "Not a FIDO device"
            );
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }
        let handle = backend.open(descriptor, false)?;
        let channel = HidChannel::new(handle)?;
        Self::new(channel)
    }

    /// Asks the device to identify itself, e.g. by flashing an LED.
    pub fn wink(&self, timeout: Duration) -> Result<bool, Error> {
        self.lock_session().channel.wink(timeout)
    }

    /// Echoes `data` off the device, exercising the full framing path.
    pub fn ping(&self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        self.lock_session().channel.ping(data, timeout)
    }
}

impl<C: Channel> Device<C> {
    /// Builds a session over an already-initialized channel. Intended for
    /// custom transports; `open` is the usual entry point.
    pub fn new(mut channel: C) -> Result<Self, Error> {
        let info = channel.ctap2_get_info()?;
        Ok(Self {
            info,
            session: Mutex::new(Session {
                channel,
                pin_uv_proto: None,
            }),
        })
    }

    /// The capability snapshot fetched when the session was created.
    pub fn info(&self) -> &Ctap2GetInfoResponse {
        &self.info
    }

    /// Closes the session and releases the transport handle.
    pub fn close(self) {
        let mut session = match self.session.into_inner() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        };
        session.channel.close();
    }

    fn lock_session(&self) -> MutexGuard<'_, Session<C>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[instrument(skip_all, fields(rp = %request.relying_party.id))]
    pub fn make_credential(
        &self,
        request: &MakeCredentialRequest,
    ) -> Result<MakeCredentialResponse, Error> {
        let mut session = self.lock_session();
        let inputs = request.extensions.clone().unwrap_or_default();

        if !self.info.option_enabled("makeCredUvNotRqd") && request.pin_uv_auth_token.is_none() {
            debug!("Device requires user verification for MakeCredential");
            return Err(Error::Platform(PlatformError::PinUvAuthTokenRequired));
        }

        let (extensions, crypto) =
            self.build_create_extensions(&mut session, &inputs, request.timeout)?;

        let mut ctap2_request = Ctap2MakeCredentialRequest {
            hash: ByteBuf::from(request.hash.clone()),
            relying_party: request.relying_party.clone(),
            user: request.user.clone(),
            algorithms: request.algorithms.clone(),
            exclude: request.exclude.clone(),
            extensions,
            options: Some(Ctap2MakeCredentialOptions {
                require_resident_key: request.require_resident_key.then_some(true),
                deprecated_require_user_verification: None,
            }),
            pin_auth_param: None,
            pin_auth_proto: None,
            enterprise_attestation: request.enterprise_attestation,
        };

        if let Some(token) = &request.pin_uv_auth_token {
            let version = session.pin_uv_protocol(&self.info)?;
            let protocol = new_pin_uv_auth_protocol(version);
            ctap2_request.calculate_and_set_uv_auth(protocol.as_ref(), token);
        }

        let response = session
            .channel
            .ctap2_make_credential(&ctap2_request, request.timeout)?;
        let authenticator_data = AuthenticatorData::parse(&response.authenticator_data)?;

        let mut outputs = CreateExtensionOutputs::default();
        if inputs.cred_props {
            outputs.cred_props = Some(CredentialPropertiesOutput {
                resident_key: request.require_resident_key,
            });
        }

        if let Some(extension_outputs) = &authenticator_data.extensions {
            if let Some(Ctap2HmacSecretOutput::Confirmed(created)) = &extension_outputs.hmac_secret
            {
                outputs.hmac_create_secret = Some(*created);
            }
            if let Some(Ctap2CredBlobOutput::Stored(stored)) = &extension_outputs.cred_blob {
                outputs.cred_blob = Some(*stored);
            }
            if let Some(policy) = extension_outputs.cred_protect {
                outputs.cred_protect = Some(policy);
            }
            if let Some(min_pin_length) = extension_outputs.min_pin_length {
                outputs.min_pin_length = Some(min_pin_length);
            }
            if let Some(encrypted) = &extension_outputs.hmac_secret_mc {
                let Some(crypto) = &crypto else {
                    warn!("hmac-secret-mc output without a matching request");
                    return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
                };
                let (first, second) = crypto.decrypt_salts(encrypted)?;
                if inputs.prf.is_some() {
                    outputs.prf = Some(PrfOutput {
                        enabled: true,
                        first: Some(first),
                        second,
                    });
                } else {
                    outputs.hmac_secret_mc = Some(HmacGetSecretOutput {
                        output1: first,
                        output2: second,
                    });
                }
            }
        }

        Ok(MakeCredentialResponse {
            format: response.format,
            authenticator_data,
            authenticator_data_raw: response.authenticator_data.into_vec(),
            attestation_statement: response.attestation_statement,
            enterprise_attestation: response.enterprise_attestation,
            extensions: outputs,
        })
    }

    /// Requests assertions for `request.relying_party_id`. The first
    /// assertion is fetched eagerly; when the device reports more than one
    /// matching credential, each further pull of the returned iterator
    /// issues exactly one GetNextAssertion round trip. Dropping the
    /// iterator early issues no further device requests.
    #[instrument(skip_all, fields(rp = %request.relying_party_id))]
    pub fn get_assertion(&self, request: &GetAssertionRequest) -> Result<Assertions<'_, C>, Error> {
        let mut session = self.lock_session();
        let inputs = request.extensions.clone().unwrap_or_default();

        let (extensions, crypto) =
            self.build_get_extensions(&mut session, &inputs, &request.allow, request.timeout)?;

        let mut ctap2_request = Ctap2GetAssertionRequest {
            relying_party_id: request.relying_party_id.clone(),
            client_data_hash: ByteBuf::from(request.hash.clone()),
            allow: request.allow.clone(),
            extensions,
            options: Some(Ctap2GetAssertionOptions {
                require_user_presence: true,
                require_user_verification: request.user_verification.is_required(),
            }),
            pin_auth_param: None,
            pin_auth_proto: None,
        };

        if let Some(token) = &request.pin_uv_auth_token {
            let version = session.pin_uv_protocol(&self.info)?;
            let protocol = new_pin_uv_auth_protocol(version);
            ctap2_request.calculate_and_set_uv_auth(protocol.as_ref(), token);
        }

        let first = session
            .channel
            .ctap2_get_assertion(&ctap2_request, request.timeout)?;
        let total = first.credentials_count.unwrap_or(1);
        debug!({ total }, "Assertion enumeration started");

        Ok(Assertions {
            session,
            first: Some(first),
            crypto,
            hmac_requested: inputs.hmac_get_secret.is_some(),
            prf_requested: inputs.prf.is_some(),
            total,
            yielded: 0,
            failed: false,
            timeout: request.timeout,
        })
    }

    /// Obtains a pinUvAuthToken using the given PIN. The token is bound to
    /// `permissions` (and `rpid`, when given) on devices implementing the
    /// pinUvAuthToken option; legacy devices fall back to getPinToken.
    #[instrument(skip_all)]
    pub fn get_pin_uv_auth_token(
        &self,
        pin: &str,
        permissions: Ctap2AuthTokenPermissionRole,
        rpid: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let mut session = self.lock_session();

        if self.info.option_enabled("noMcGaPermissionsWithClientPin")
            && permissions.intersects(
                Ctap2AuthTokenPermissionRole::MAKE_CREDENTIAL
                    | Ctap2AuthTokenPermissionRole::GET_ASSERTION,
            )
        {
            debug!("Device forbids mc/ga permissions on PIN-derived tokens");
            return Err(Error::Platform(PlatformError::NotSupported));
        }

        if !self.info.option_present("clientPin") {
            return Err(Error::Platform(PlatformError::PinNotSupported));
        }
        if !self.info.option_enabled("clientPin") {
            return Err(Error::Platform(PlatformError::PinNotSet));
        }

        if !self.info.option_present("bioEnroll")
            && permissions.contains(Ctap2AuthTokenPermissionRole::BIO_ENROLLMENT)
        {
            return Err(Error::Platform(PlatformError::NotSupported));
        }
        if !self.info.option_enabled("authnrCfg")
            && permissions.contains(Ctap2AuthTokenPermissionRole::AUTHENTICATOR_CONFIGURATION)
        {
            return Err(Error::Platform(PlatformError::NotSupported));
        }

        let version = session.pin_uv_protocol(&self.info)?;
        let (protocol, platform_key, shared_secret) = session.encapsulate(version, timeout)?;

        let pin_hash_enc = protocol.encrypt(&shared_secret, &pin_hash(pin.as_bytes()))?;

        let request = if self.info.option_enabled("pinUvAuthToken") {
            Ctap2ClientPinRequest::new_get_pin_token_with_perm(
                version,
                platform_key,
                &pin_hash_enc,
                permissions,
                rpid,
            )
        } else {
            Ctap2ClientPinRequest::new_get_pin_token(version, platform_key, &pin_hash_enc)
        };

        let response = session.channel.ctap2_client_pin(&request, timeout)?;
        let Some(encrypted_token) = response.pin_uv_auth_token else {
            warn!("ClientPIN response is missing the pinUvAuthToken");
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        };
        protocol.decrypt(&shared_secret, &encrypted_token)
    }

    /// Sets the initial PIN on a device which has none.
    #[instrument(skip_all)]
    pub fn set_pin(&self, new_pin: &str, timeout: Duration) -> Result<(), Error> {
        self.check_pin_length(new_pin)?;
        let mut session = self.lock_session();
        if !self.info.option_present("clientPin") {
            return Err(Error::Platform(PlatformError::PinNotSupported));
        }

        let version = session.pin_uv_protocol(&self.info)?;
        let (protocol, platform_key, shared_secret) = session.encapsulate(version, timeout)?;

        let new_pin_enc = protocol.encrypt(&shared_secret, &pad_pin(new_pin))?;
        let uv_auth_param = protocol.authenticate(&shared_secret, &new_pin_enc);

        let request =
            Ctap2ClientPinRequest::new_set_pin(version, &new_pin_enc, platform_key, &uv_auth_param);
        session.channel.ctap2_client_pin(&request, timeout)?;
        Ok(())
    }

    /// Changes the device PIN, proving knowledge of the current one.
    #[instrument(skip_all)]
    pub fn change_pin(
        &self,
        current_pin: &str,
        new_pin: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.check_pin_length(new_pin)?;
        let mut session = self.lock_session();
        if !self.info.option_present("clientPin") {
            return Err(Error::Platform(PlatformError::PinNotSupported));
        }

        let version = session.pin_uv_protocol(&self.info)?;
        let (protocol, platform_key, shared_secret) = session.encapsulate(version, timeout)?;

        let new_pin_enc = protocol.encrypt(&shared_secret, &pad_pin(new_pin))?;
        let pin_hash_enc = protocol.encrypt(&shared_secret, &pin_hash(current_pin.as_bytes()))?;
        let uv_auth_param = protocol.authenticate(
            &shared_secret,
            &[new_pin_enc.as_slice(), pin_hash_enc.as_slice()].concat(),
        );

        let request = Ctap2ClientPinRequest::new_change_pin(
            version,
            &new_pin_enc,
            &pin_hash_enc,
            platform_key,
            &uv_auth_param,
        );
        session.channel.ctap2_client_pin(&request, timeout)?;
        Ok(())
    }

    /// Remaining PIN attempts, and whether a power cycle is required first.
    pub fn get_pin_retries(&self, timeout: Duration) -> Result<(u32, Option<bool>), Error> {
        let mut session = self.lock_session();
        let request = Ctap2ClientPinRequest::new_get_pin_retries();
        let response = session.channel.ctap2_client_pin(&request, timeout)?;
        let Some(retries) = response.pin_retries else {
            return Err(Error::Platform(PlatformError::InvalidDeviceResponse));
        };
        Ok((retries, response.power_cycle_state))
    }

    /// Remaining built-in user verification attempts.
    pub fn get_uv_retries(&self, timeout: Duration) -> Result<u32, Error> {
        let mut session = self.lock_session();
        let request = Ctap2ClientPinRequest::new_get_uv_retries();
        let response = session.channel.ctap2_client_pin(&request, timeout)?;
        response
            .uv_retries
            .ok_or(Error::Platform(PlatformError::InvalidDeviceResponse))
    }

    fn check_pin_length(&self, pin: &str) -> Result<(), Error> {
        // If minPINLength is absent, the platform minimum is 4 code points.
        if pin.len() < self.info.min_pin_length.unwrap_or(4) as usize {
            return Err(Error::Platform(PlatformError::PinTooShort));
        }
        // The maximum UTF-8 representation is 63 bytes.
        if pin.len() >= 64 {
            return Err(Error::Platform(PlatformError::PinTooLong));
        }
        Ok(())
    }

    fn build_create_extensions(
        &self,
        session: &mut Session<C>,
        inputs: &CreateExtensionInputs,
        timeout: Duration,
    ) -> Result<(Option<Ctap2MakeCredentialExtensions>, Option<ExtensionCrypto>), Error> {
        if inputs.large_blob.is_some() {
            debug!("largeBlob extension is not supported");
            return Err(Error::Platform(PlatformError::UnsupportedExtension));
        }
        if inputs.hmac_secret_mc.is_some() && inputs.prf.is_some() {
            debug!("hmac-secret and prf extensions are mutually exclusive");
            return Err(Error::Platform(PlatformError::ConflictingExtensions));
        }

        let mut extensions = Ctap2MakeCredentialExtensions::default();
        let mut crypto = None;

        if let Some(create_secret) = inputs.hmac_create_secret {
            if !self.info.supports_extension(EXTENSION_HMAC_SECRET) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.hmac_secret = Some(create_secret);
        }

        if let Some(hmac_inputs) = &inputs.hmac_secret_mc {
            if !self.info.supports_extension(EXTENSION_HMAC_SECRET_MC) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            let salt = concat_hmac_salts(hmac_inputs)?;
            let version = session.pin_uv_protocol(&self.info)?;
            let (input, exchange) = session.build_hmac_secret_input(version, &salt, timeout)?;
            extensions.hmac_secret = Some(true);
            extensions.hmac_secret_mc = Some(input);
            crypto = Some(exchange);
        }

        if let Some(prf) = &inputs.prf {
            if !self.info.supports_extension(EXTENSION_HMAC_SECRET_MC) {
                debug!("Device cannot serve prf during registration");
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            if !prf.eval_by_credential.is_empty() {
                debug!("evalByCredential is not valid during registration");
                return Err(Error::Platform(PlatformError::NotSupported));
            }
            let Some(eval) = &prf.eval else {
                return Err(Error::Platform(PlatformError::SyntaxError));
            };
            let salt = prf_salts(eval);
            let version = session.pin_uv_protocol(&self.info)?;
            let (input, exchange) = session.build_hmac_secret_input(version, &salt, timeout)?;
            extensions.hmac_secret = Some(true);
            extensions.hmac_secret_mc = Some(input);
            crypto = Some(exchange);
        }

        if let Some(protection) = &inputs.cred_protect {
            if protection.enforce_policy
                && protection.policy
                    != Ctap2CredentialProtectionPolicy::UserVerificationOptional
                && !self.info.supports_extension(EXTENSION_CRED_PROTECT)
            {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.cred_protect = Some(protection.policy);
        }

        if let Some(blob) = &inputs.cred_blob {
            if !self.info.supports_extension(EXTENSION_CRED_BLOB) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            if blob.len() > self.info.max_cred_blob_length.unwrap_or(0) as usize {
                debug!(
                    { len = blob.len(), max = ?self.info.max_cred_blob_length },
                    "credBlob exceeds the device's maximum length"
                );
                return Err(Error::Platform(PlatformError::NotSupported));
            }
            extensions.cred_blob = Some(ByteBuf::from(blob.clone()));
        }

        if let Some(min_pin_length) = inputs.min_pin_length {
            if !self.info.supports_extension(EXTENSION_MIN_PIN_LENGTH) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.min_pin_length = Some(min_pin_length);
        }

        if let Some(pin_complexity_policy) = inputs.pin_complexity_policy {
            if !self.info.supports_extension(EXTENSION_PIN_COMPLEXITY_POLICY) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.pin_complexity_policy = Some(pin_complexity_policy);
        }

        let extensions = (!extensions.skip_serializing()).then_some(extensions);
        Ok((extensions, crypto))
    }

    fn build_get_extensions(
        &self,
        session: &mut Session<C>,
        inputs: &GetExtensionInputs,
        allow: &[crate::proto::ctap2::Ctap2PublicKeyCredentialDescriptor],
        timeout: Duration,
    ) -> Result<(Option<Ctap2GetAssertionExtensions>, Option<ExtensionCrypto>), Error> {
        if inputs.large_blob.is_some() {
            debug!("largeBlob extension is not supported");
            return Err(Error::Platform(PlatformError::UnsupportedExtension));
        }
        if inputs.hmac_get_secret.is_some() && inputs.prf.is_some() {
            debug!("hmac-secret and prf extensions are mutually exclusive");
            return Err(Error::Platform(PlatformError::ConflictingExtensions));
        }

        let mut extensions = Ctap2GetAssertionExtensions::default();
        let mut crypto = None;

        if let Some(hmac_inputs) = &inputs.hmac_get_secret {
            if !self.info.supports_extension(EXTENSION_HMAC_SECRET) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            let salt = concat_hmac_salts(hmac_inputs)?;
            let version = session.pin_uv_protocol(&self.info)?;
            let (input, exchange) = session.build_hmac_secret_input(version, &salt, timeout)?;
            extensions.hmac_secret = Some(input);
            crypto = Some(exchange);
        }

        if let Some(prf) = &inputs.prf {
            if !self.info.supports_extension(EXTENSION_HMAC_SECRET) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            let eval = resolve_prf_values(prf, allow)?;
            let salt = prf_salts(eval);
            let version = session.pin_uv_protocol(&self.info)?;
            let (input, exchange) = session.build_hmac_secret_input(version, &salt, timeout)?;
            extensions.hmac_secret = Some(input);
            crypto = Some(exchange);
        }

        if inputs.cred_blob {
            if !self.info.supports_extension(EXTENSION_CRED_BLOB) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.cred_blob = Some(true);
        }

        if let Some(third_party_payment) = inputs.third_party_payment {
            if !self.info.supports_extension(EXTENSION_THIRD_PARTY_PAYMENT) {
                return Err(Error::Platform(PlatformError::UnsupportedExtension));
            }
            extensions.third_party_payment = Some(third_party_payment);
        }

        let extensions = (!extensions.skip_serializing()).then_some(extensions);
        Ok((extensions, crypto))
    }
}

impl<C: Channel> Session<C> {
    /// The PIN/UV auth protocol for this session: negotiated on first use
    /// (first advertised entry) and cached afterwards.
    fn pin_uv_protocol(
        &mut self,
        info: &Ctap2GetInfoResponse,
    ) -> Result<Ctap2PinUvAuthProtocol, Error> {
        if let Some(version) = self.pin_uv_proto {
            return Ok(version);
        }
        let version = info.pin_uv_auth_protocol()?;
        debug!(?version, "Negotiated PIN/UV auth protocol");
        self.pin_uv_proto = Some(version);
        Ok(version)
    }

    fn get_key_agreement(
        &mut self,
        version: Ctap2PinUvAuthProtocol,
        timeout: Duration,
    ) -> Result<cosey::PublicKey, Error> {
        let request = Ctap2ClientPinRequest::new_get_key_agreement(version);
        let response = self.channel.ctap2_client_pin(&request, timeout)?;
        response.key_agreement.ok_or_else(|| {
            warn!("ClientPIN response is missing the keyAgreement");
            Error::Platform(PlatformError::InvalidDeviceResponse)
        })
    }

    /// Performs one key agreement with the device: fetches its public key
    /// and encapsulates with a fresh protocol instance.
    fn encapsulate(
        &mut self,
        version: Ctap2PinUvAuthProtocol,
        timeout: Duration,
    ) -> Result<(Box<dyn PinUvAuthProtocol>, cosey::PublicKey, Vec<u8>), Error> {
        let peer_key = self.get_key_agreement(version, timeout)?;
        let protocol = new_pin_uv_auth_protocol(version);
        let (platform_key, shared_secret) = protocol.encapsulate(&peer_key)?;
        Ok((protocol, platform_key, shared_secret))
    }

    fn build_hmac_secret_input(
        &mut self,
        version: Ctap2PinUvAuthProtocol,
        salt: &[u8],
        timeout: Duration,
    ) -> Result<(Ctap2HmacSecretInput, ExtensionCrypto), Error> {
        let (protocol, platform_key, shared_secret) = self.encapsulate(version, timeout)?;
        let salt_enc = protocol.encrypt(&shared_secret, salt)?;
        let salt_auth = protocol.authenticate(&shared_secret, &salt_enc);
        Ok((
            Ctap2HmacSecretInput {
                key_agreement: platform_key,
                salt_enc: ByteBuf::from(salt_enc),
                salt_auth: ByteBuf::from(salt_auth),
                pin_uv_auth_protocol: Some(version),
            },
            ExtensionCrypto {
                protocol,
                shared_secret,
            },
        ))
    }
}

/// Lazy, single-pass, non-restartable assertion sequence. Holds the
/// session lock for its lifetime: the device stays idle between pulls and
/// no other operation can interleave with the enumeration.
pub struct Assertions<'a, C: Channel> {
    session: MutexGuard<'a, Session<C>>,
    first: Option<Ctap2GetAssertionResponse>,
    crypto: Option<ExtensionCrypto>,
    hmac_requested: bool,
    prf_requested: bool,
    total: u32,
    yielded: u32,
    failed: bool,
    timeout: Duration,
}

impl<C: Channel> Assertions<'_, C> {
    /// Number of matching credentials reported by the device.
    pub fn credential_count(&self) -> u32 {
        self.total
    }
}

impl<C: Channel> core::fmt::Debug for Assertions<'_, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Assertions")
            .field("hmac_requested", &self.hmac_requested)
            .field("prf_requested", &self.prf_requested)
            .field("total", &self.total)
            .field("yielded", &self.yielded)
            .field("failed", &self.failed)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<C: Channel> Iterator for Assertions<'_, C> {
    type Item = Result<Assertion, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.yielded >= self.total {
            return None;
        }
        let response = match self.first.take() {
            Some(first) => Ok(first),
            None => self.session.channel.ctap2_get_next_assertion(self.timeout),
        };
        self.yielded += 1;

        let mapped = response.and_then(|response| {
            map_assertion(
                response,
                self.crypto.as_ref(),
                self.hmac_requested,
                self.prf_requested,
            )
        });
        if mapped.is_err() {
            // The sequence is not restartable; don't issue further requests.
            self.failed = true;
        }
        Some(mapped)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.failed {
            0
        } else {
            (self.total - self.yielded) as usize
        };
        (remaining, Some(remaining))
    }
}

fn map_assertion(
    response: Ctap2GetAssertionResponse,
    crypto: Option<&ExtensionCrypto>,
    hmac_requested: bool,
    prf_requested: bool,
) -> Result<Assertion, Error> {
    let authenticator_data = AuthenticatorData::parse(&response.authenticator_data)?;

    let mut outputs = GetExtensionOutputs::default();
    if let Some(extension_outputs) = &authenticator_data.extensions {
        if let Some(Ctap2CredBlobOutput::Blob(blob)) = &extension_outputs.cred_blob {
            outputs.cred_blob = Some(blob.to_vec());
        }
        if let Some(third_party_payment) = extension_outputs.third_party_payment {
            outputs.third_party_payment = Some(third_party_payment);
        }
        if let Some(Ctap2HmacSecretOutput::Encrypted(encrypted)) = &extension_outputs.hmac_secret {
            match crypto {
                None => warn!("Unrequested hmac-secret output, ignoring"),
                Some(crypto) => {
                    let (first, second) = crypto.decrypt_salts(encrypted)?;
                    if hmac_requested {
                        outputs.hmac_get_secret = Some(HmacGetSecretOutput {
                            output1: first.clone(),
                            output2: second.clone(),
                        });
                    }
                    if prf_requested {
                        outputs.prf = Some(PrfOutput {
                            enabled: true,
                            first: Some(first),
                            second,
                        });
                    }
                }
            }
        }
    }

    Ok(Assertion {
        credential_id: response.credential_id,
        authenticator_data,
        authenticator_data_raw: response.authenticator_data.into_vec(),
        signature: response.signature.into_vec(),
        user: response.user,
        credentials_count: response.credentials_count,
        user_selected: response.user_selected,
        extensions: outputs,
    })
}

/// Validates and concatenates hmac-secret salts. Each salt must be exactly
/// 32 bytes; anything else is a protocol-usage error raised before any
/// device I/O.
fn concat_hmac_salts(input: &HmacGetSecretInput) -> Result<Vec<u8>, Error> {
    if input.salt1.len() != HMAC_SECRET_SALT_LEN {
        return Err(Error::Platform(PlatformError::InvalidSaltSize));
    }
    let mut salt = input.salt1.clone();
    if let Some(salt2) = &input.salt2 {
        if salt2.len() != HMAC_SECRET_SALT_LEN {
            return Err(Error::Platform(PlatformError::InvalidSaltSize));
        }
        salt.extend(salt2);
    }
    Ok(salt)
}

/// PRF domain separation: salt = SHA-256("WebAuthn PRF" || 0x00 || input),
/// one 32-byte block per evaluation input.
fn prf_eval_salt(input: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::default();
    hasher.update(b"WebAuthn PRF");
    hasher.update([0x00]);
    hasher.update(input);
    hasher.finalize().to_vec()
}

fn prf_salts(values: &PrfValues) -> Vec<u8> {
    let mut salt = prf_eval_salt(&values.first);
    if let Some(second) = &values.second {
        salt.extend(prf_eval_salt(second));
    }
    salt
}

/// Picks the PRF evaluation inputs for this request: a per-credential
/// entry matching the allow list if one exists, the general `eval`
/// otherwise.
fn resolve_prf_values<'a>(
    prf: &'a crate::ops::webauthn::PrfInput,
    allow: &[crate::proto::ctap2::Ctap2PublicKeyCredentialDescriptor],
) -> Result<&'a PrfValues, Error> {
    if !prf.eval_by_credential.is_empty() && allow.is_empty() {
        debug!("evalByCredential requires a non-empty allow list");
        return Err(Error::Platform(PlatformError::NotSupported));
    }

    for descriptor in allow {
        if let Some(values) = prf.eval_by_credential.get(descriptor.id.as_slice()) {
            return Ok(values);
        }
    }
    prf.eval
        .as_ref()
        .ok_or(Error::Platform(PlatformError::SyntaxError))
}

/// paddedPin: the PIN padded on the right with zero bytes to 64 bytes.
fn pad_pin(pin: &str) -> Vec<u8> {
    let mut padded = pin.as_bytes().to_vec();
    padded.resize(64, 0x00);
    padded
}
