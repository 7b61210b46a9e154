use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, trace};

use crate::proto::ctap2::cbor::{CborRequest, CborResponse};
use crate::proto::ctap2::model::{
    Ctap2ClientPinRequest, Ctap2ClientPinResponse, Ctap2CommandCode, Ctap2GetAssertionRequest,
    Ctap2GetAssertionResponse, Ctap2GetInfoResponse, Ctap2MakeCredentialRequest,
    Ctap2MakeCredentialResponse,
};
use crate::proto::error::CtapError;
use crate::transport::channel::Channel;
use crate::transport::error::Error;

const TIMEOUT_GET_INFO: Duration = Duration::from_millis(250);

/// The CTAP2 command layer: one method per authenticator command, encoding
/// typed requests and decoding typed responses over a [`Channel`].
pub trait Ctap2 {
    fn ctap2_get_info(&mut self) -> Result<Ctap2GetInfoResponse, Error>;

    fn ctap2_make_credential(
        &mut self,
        request: &Ctap2MakeCredentialRequest,
        timeout: Duration,
    ) -> Result<Ctap2MakeCredentialResponse, Error>;

    fn ctap2_get_assertion(
        &mut self,
        request: &Ctap2GetAssertionRequest,
        timeout: Duration,
    ) -> Result<Ctap2GetAssertionResponse, Error>;

    /// Pulls the next assertion of an ongoing multi-credential enumeration.
    /// Carries no parameters; only valid immediately after GetAssertion.
    fn ctap2_get_next_assertion(
        &mut self,
        timeout: Duration,
    ) -> Result<Ctap2GetAssertionResponse, Error>;

    fn ctap2_client_pin(
        &mut self,
        request: &Ctap2ClientPinRequest,
        timeout: Duration,
    ) -> Result<Ctap2ClientPinResponse, Error>;
}

impl<C> Ctap2 for C
where
    C: Channel,
{
    #[instrument(skip_all)]
    fn ctap2_get_info(&mut self) -> Result<Ctap2GetInfoResponse, Error> {
        let request = CborRequest::new(Ctap2CommandCode::AuthenticatorGetInfo);
        let response: Ctap2GetInfoResponse = transact(self, &request, TIMEOUT_GET_INFO)?;
        info!(?response, "CTAP2 GetInfo response");
        Ok(response)
    }

    #[instrument(skip_all)]
    fn ctap2_make_credential(
        &mut self,
        request: &Ctap2MakeCredentialRequest,
        timeout: Duration,
    ) -> Result<Ctap2MakeCredentialResponse, Error> {
        trace!(?request);
        let cbor_request =
            CborRequest::from_request(Ctap2CommandCode::AuthenticatorMakeCredential, request)?;
        let response: Ctap2MakeCredentialResponse = transact(self, &cbor_request, timeout)?;
        debug!("CTAP2 MakeCredential successful");
        Ok(response)
    }

    #[instrument(skip_all)]
    fn ctap2_get_assertion(
        &mut self,
        request: &Ctap2GetAssertionRequest,
        timeout: Duration,
    ) -> Result<Ctap2GetAssertionResponse, Error> {
        trace!(?request);
        let cbor_request =
            CborRequest::from_request(Ctap2CommandCode::AuthenticatorGetAssertion, request)?;
        let response: Ctap2GetAssertionResponse = transact(self, &cbor_request, timeout)?;
        debug!(
            { credentials_count = ?response.credentials_count },
            "CTAP2 GetAssertion successful"
        );
        Ok(response)
    }

    #[instrument(skip_all)]
    fn ctap2_get_next_assertion(
        &mut self,
        timeout: Duration,
    ) -> Result<Ctap2GetAssertionResponse, Error> {
        let request = CborRequest::new(Ctap2CommandCode::AuthenticatorGetNextAssertion);
        transact(self, &request, timeout)
    }

    #[instrument(skip_all, fields(command = ?request.command))]
    fn ctap2_client_pin(
        &mut self,
        request: &Ctap2ClientPinRequest,
        timeout: Duration,
    ) -> Result<Ctap2ClientPinResponse, Error> {
        trace!(?request);
        let cbor_request =
            CborRequest::from_request(Ctap2CommandCode::AuthenticatorClientPin, request)?;
        let response = transact_raw(self, &cbor_request, timeout)?;
        // Several ClientPIN subcommands succeed with an empty body.
        match response.data {
            Some(_) => response.decoded(),
            None => Ok(Ctap2ClientPinResponse::default()),
        }
    }
}

fn transact<C: Channel, T: DeserializeOwned>(
    channel: &mut C,
    request: &CborRequest,
    timeout: Duration,
) -> Result<T, Error> {
    transact_raw(channel, request, timeout)?.decoded()
}

fn transact_raw<C: Channel>(
    channel: &mut C,
    request: &CborRequest,
    timeout: Duration,
) -> Result<CborResponse, Error> {
    channel.cbor_send(request, timeout)?;
    let response = channel.cbor_recv(timeout)?;
    if response.status_code != CtapError::Ok {
        debug!(
            { command = ?request.command, status = ?response.status_code },
            "Device refused CTAP2 command"
        );
        return Err(Error::Command(request.command, response.status_code));
    }
    Ok(response)
}
