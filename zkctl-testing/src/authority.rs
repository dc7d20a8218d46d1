//! In-process certificate authority backed by rcgen.

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use zkctl_core::{
    CertificateAuthority, Clock, ControllerError, RequestId, Result, SignedCertificate,
    SigningRequest,
};

struct Issuer {
    name: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Issuer {
    fn generate(name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(authority_error)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

        let key = KeyPair::generate().map_err(authority_error)?;
        let cert = params.self_signed(&key).map_err(authority_error)?;
        Ok(Self {
            name: name.to_string(),
            cert,
            key,
        })
    }
}

struct AuthorityState {
    issuer: Issuer,
    generation: u32,
    auto_sign: bool,
    validity: Duration,
    submitted: Vec<SigningRequest>,
    signed: HashMap<RequestId, SignedCertificate>,
}

/// Signs every request with its current CA.
///
/// The subject and SANs of a request are honoured; the certificate is
/// issued for a fresh key since the CSR is not parsed.
pub struct MockAuthority {
    clock: Arc<dyn Clock>,
    state: Mutex<AuthorityState>,
}

impl MockAuthority {
    pub fn new(clock: Arc<dyn Clock>, validity: Duration) -> Result<Self> {
        Ok(Self {
            clock,
            state: Mutex::new(AuthorityState {
                issuer: Issuer::generate("zkctl-test-ca-1")?,
                generation: 1,
                auto_sign: true,
                validity,
                submitted: Vec::new(),
                signed: HashMap::new(),
            }),
        })
    }

    /// PEM of the CA currently signing.
    pub fn ca_pem(&self) -> String {
        self.state.lock().issuer.cert.pem()
    }

    /// Replace the signing CA. Returns the new CA PEM.
    pub fn rotate_ca(&self) -> Result<String> {
        let mut state = self.state.lock();
        state.generation += 1;
        state.issuer = Issuer::generate(&format!("zkctl-test-ca-{}", state.generation))?;
        debug!("Mock authority now signing with {}", state.issuer.name);
        Ok(state.issuer.cert.pem())
    }

    /// Hold requests until [`sign_pending`](Self::sign_pending) is called.
    pub fn set_auto_sign(&self, auto_sign: bool) {
        self.state.lock().auto_sign = auto_sign;
    }

    pub fn sign_pending(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let pending: Vec<SigningRequest> = state
            .submitted
            .iter()
            .filter(|request| !state.signed.contains_key(&request.request_id))
            .cloned()
            .collect();
        for request in &pending {
            let signed = sign(&state, request, now)?;
            state.signed.insert(request.request_id, signed);
        }
        Ok(pending.len())
    }

    pub fn submitted(&self) -> Vec<SigningRequest> {
        self.state.lock().submitted.clone()
    }
}

fn sign(state: &AuthorityState, request: &SigningRequest, now_ms: u64) -> Result<SignedCertificate> {
    let mut params = CertificateParams::new(request.sans.clone()).map_err(authority_error)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, request.subject.as_str());
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;

    let key = KeyPair::generate().map_err(authority_error)?;
    let cert = params
        .signed_by(&key, &state.issuer.cert, &state.issuer.key)
        .map_err(authority_error)?;
    let ca = state.issuer.cert.pem();

    Ok(SignedCertificate {
        certificate: cert.pem(),
        ca: ca.clone(),
        chain: vec![ca],
        not_before_ms: now_ms,
        not_after_ms: now_ms + state.validity.as_millis() as u64,
    })
}

fn authority_error(e: rcgen::Error) -> ControllerError {
    ControllerError::authority(e.to_string())
}

#[async_trait]
impl CertificateAuthority for MockAuthority {
    async fn submit(&self, request: SigningRequest) -> Result<()> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        debug!(
            "Mock authority received request {} for {} generation {}",
            request.request_id, request.subject, request.generation
        );
        if state.auto_sign {
            let signed = sign(&state, &request, now)?;
            state.signed.insert(request.request_id, signed);
        }
        state.submitted.push(request);
        Ok(())
    }

    async fn poll(&self, request_id: RequestId) -> Result<Option<SignedCertificate>> {
        Ok(self.state.lock().signed.get(&request_id).cloned())
    }
}
