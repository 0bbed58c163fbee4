//! Authenticated controller session.
//!
//! Drives the connect sequence end to end: API key and public key over
//! plain HTTP, transport open, RSA-sealed session-key exchange, salted
//! challenge-response, and JWT issuance over the encrypted command
//! channel. The API key, public key, and AES material survive reconnects
//! so the controller keeps accepting the same sealed session key.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rsa::RsaPublicKey;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::{self, HashAlg, AES_BLOCK};
use crate::error::ApiError;
use crate::transport::{ControlResponse, FrameTransport, StateFrame};

/// Client identity presented in the token request.
const CLIENT_UUID: &str = "098802e1-02b4-603c-ffffeee000d80cfd";
const CLIENT_INFO: &str = "halox";

/// Token permission level requested from `getjwt`.
const TOKEN_PERMISSION: u8 = 2;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Controller endpoint and credentials, handed in by the core layer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// `host:port`.
    pub address: String,
    pub username: String,
    pub password: SecretString,
}

/// The instant the controller counts token expiry offsets from.
fn controller_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap()
}

// ── Wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HttpEnvelope {
    #[serde(rename = "LL")]
    ll: HttpBody,
}

#[derive(Debug, Deserialize)]
struct HttpBody {
    #[serde(rename = "Code", alias = "code", default)]
    code: String,
    #[serde(default)]
    value: String,
}

/// The `apiKey` blob, once its single quotes have been fixed up.
#[derive(Debug, Deserialize)]
struct ApiKeyInfo {
    #[serde(alias = "SNR", default)]
    snr: String,
    #[serde(alias = "Version", default)]
    version: String,
    #[serde(alias = "Key")]
    key: String,
}

/// `getkey2` reply value.
#[derive(Debug, Deserialize)]
struct UserKeyInfo {
    key: String,
    salt: String,
    #[serde(rename = "hashAlg")]
    hash_alg: String,
}

/// `getjwt` / `refreshjwt` reply value.
#[derive(Debug, Deserialize)]
struct TokenGrant {
    token: String,
    #[serde(rename = "validUntil")]
    valid_until: f64,
}

// ── ControllerSession ────────────────────────────────────────────────

/// One logical session with the controller.
///
/// `connect` may be called repeatedly; cached identity material
/// (API key, public key, AES key/IV) is reused across calls.
pub struct ControllerSession {
    config: SessionConfig,
    http: reqwest::Client,

    api_key: Option<String>,
    public_key: Option<RsaPublicKey>,

    aes_key: Option<[u8; 32]>,
    aes_iv: Option<[u8; 16]>,
    sealed_session_key: Option<String>,

    command_salt: Option<[u8; 2]>,
    server_salt: Option<[u8; AES_BLOCK]>,

    token: Option<String>,
    token_expiry: Option<DateTime<Utc>>,

    transport: Option<FrameTransport>,
}

impl ControllerSession {
    pub fn new(config: SessionConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            http,
            api_key: None,
            public_key: None,
            aes_key: None,
            aes_iv: None,
            sealed_session_key: None,
            command_salt: None,
            server_salt: None,
            token: None,
            token_expiry: None,
            transport: None,
        })
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Absolute expiry of the current bearer token, if one is held.
    pub fn token_expiry(&self) -> Option<DateTime<Utc>> {
        self.token_expiry
    }

    /// Salt the controller returned during key exchange. Retained for
    /// encrypted commands but not consulted by the base protocol.
    pub fn server_salt(&self) -> Option<[u8; AES_BLOCK]> {
        self.server_salt
    }

    // ── Connect sequence ─────────────────────────────────────────────

    /// Run the full connect sequence, replacing any previous transport.
    ///
    /// Returns the state stream and the reconnect signal of the new
    /// transport. Every step failing fails the whole connect.
    pub async fn connect(
        &mut self,
    ) -> Result<(mpsc::Receiver<StateFrame>, mpsc::Receiver<()>), ApiError> {
        if self.api_key.is_none() {
            self.fetch_api_key().await?;
        }
        if self.public_key.is_none() {
            self.fetch_public_key().await?;
        }

        if let Some(old) = self.transport.take() {
            old.close().await;
        }
        let (transport, state_rx, reconnect_rx) =
            FrameTransport::open(&self.config.address).await?;
        self.transport = Some(transport);

        self.exchange_session_key().await?;
        self.acquire_token().await?;

        info!(address = %self.config.address, "connected and authenticated");
        Ok((state_rx, reconnect_rx))
    }

    /// Close the transport, if one is open.
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn transport(&self) -> Result<&FrameTransport, ApiError> {
        self.transport.as_ref().ok_or(ApiError::NotConnected)
    }

    // ── HTTP bootstrap ───────────────────────────────────────────────

    fn http_url(&self, path: &str) -> String {
        format!("http://{}/{}", self.config.address, path)
    }

    /// GET a `jdev` endpoint over plain HTTP and unwrap the `{"LL": ...}`
    /// envelope, returning the string `value`.
    async fn fetch_value(&self, path: &str) -> Result<String, ApiError> {
        let url = self.http_url(path);
        debug!(%url, "GET");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let envelope: HttpEnvelope = response.json().await?;
        if envelope.ll.code != "200" {
            return Err(ApiError::ControlStatus {
                code: envelope.ll.code,
                control: path.to_string(),
            });
        }
        Ok(envelope.ll.value)
    }

    /// Step 1: the API-key blob. It arrives as JSON-shaped text using
    /// single quotes; substitute and parse.
    async fn fetch_api_key(&mut self) -> Result<(), ApiError> {
        let raw = self.fetch_value("jdev/cfg/apiKey").await?;
        let info: ApiKeyInfo = serde_json::from_str(&raw.replace('\'', "\""))?;
        info!(serial = %info.snr, version = %info.version, "found controller");
        self.api_key = Some(info.key);
        Ok(())
    }

    /// Step 2: the controller's RSA public key, served in its PEM-ish
    /// house style.
    async fn fetch_public_key(&mut self) -> Result<(), ApiError> {
        let raw = self.fetch_value("jdev/sys/getPublicKey").await?;
        self.public_key = Some(crypto::parse_public_key(&raw)?);
        Ok(())
    }

    // ── Key exchange ─────────────────────────────────────────────────

    /// Lazily create the AES key + IV and seal `"<hexkey>:<hexiv>"` to the
    /// controller's RSA key. The material is created once per process and
    /// reused on every reconnect.
    fn ensure_session_key(&mut self) -> Result<(), ApiError> {
        if self.sealed_session_key.is_some() {
            return Ok(());
        }

        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);

        let payload = format!("{}:{}", hex::encode(key), hex::encode(iv));
        let public_key = self.public_key.as_ref().ok_or(ApiError::NotConnected)?;
        let sealed = crypto::rsa_encrypt(public_key, payload.as_bytes())?;

        self.aes_key = Some(key);
        self.aes_iv = Some(iv);
        self.sealed_session_key = Some(BASE64.encode(sealed));
        debug!("generated AES session key and sealed it to the controller");
        Ok(())
    }

    /// Step 4: present the sealed session key. The reply value is one AES
    /// block holding the server salt.
    async fn exchange_session_key(&mut self) -> Result<(), ApiError> {
        self.ensure_session_key()?;
        let sealed = self
            .sealed_session_key
            .clone()
            .ok_or(ApiError::NotConnected)?;

        let response = self
            .transport()?
            .request_control(&format!("jdev/sys/keyexchange/{sealed}"))
            .await?;

        let mut block = BASE64.decode(response.value_str()?)?;
        if block.len() < AES_BLOCK {
            block = crypto::pkcs5_pad(&block, AES_BLOCK);
        }
        let key = self.aes_key.ok_or(ApiError::NotConnected)?;
        let salt = crypto::aes_decrypt_block(&key, &block)?;
        debug!(salt = %hex::encode(salt), "server salt received");
        self.server_salt = Some(salt);
        Ok(())
    }

    // ── Challenge-response and token ─────────────────────────────────

    /// Step 5: `getkey2` -- the per-user HMAC key, salt, and hash
    /// algorithm chosen by the controller.
    async fn fetch_user_key(&self) -> Result<(Vec<u8>, String, HashAlg), ApiError> {
        let response = self
            .transport()?
            .request_control(&format!("jdev/sys/getkey2/{}", self.config.username))
            .await?;
        let info: UserKeyInfo = serde_json::from_value(response.ll.value.clone())?;
        let alg = HashAlg::from_wire(&info.hash_alg)?;
        let key = hex::decode(info.key)?;
        Ok((key, info.salt, alg))
    }

    /// Steps 6-9: hash the credentials and request a JWT over the
    /// encrypted channel.
    async fn acquire_token(&mut self) -> Result<(), ApiError> {
        let (user_key, salt, alg) = self.fetch_user_key().await?;

        let credential = credential_hash(
            alg,
            &user_key,
            &self.config.username,
            self.config.password.expose_secret(),
            &salt,
        )?;

        let cmd = format!(
            "jdev/sys/getjwt/{credential}/{}/{TOKEN_PERMISSION}/{CLIENT_UUID}/{CLIENT_INFO}",
            self.config.username
        );
        let response = self.send_encrypted(&cmd).await?;
        if response.ll.code != "200" {
            warn!(code = %response.ll.code, "token request refused");
            return Err(ApiError::TokenRefused {
                code: response.ll.code.clone(),
                detail: response.ll.value.to_string(),
            });
        }
        self.store_token(&response)
    }

    fn store_token(&mut self, response: &ControlResponse) -> Result<(), ApiError> {
        let grant: TokenGrant = serde_json::from_value(response.ll.value.clone())?;
        let expiry = controller_epoch() + chrono::Duration::seconds(grant.valid_until as i64);
        info!(%expiry, "token received");
        self.token = Some(grant.token);
        self.token_expiry = Some(expiry);
        Ok(())
    }

    /// HMAC of the current token under a freshly fetched user key.
    /// Lower hex, unlike the credential proof.
    async fn token_hash(&self) -> Result<String, ApiError> {
        let (user_key, _salt, alg) = self.fetch_user_key().await?;
        let token = self.token.as_deref().ok_or(ApiError::NotConnected)?;
        crypto::hmac_lower_hex(alg, &user_key, token.as_bytes())
    }

    /// Refresh the bearer token before it expires.
    pub async fn refresh_token(&mut self) -> Result<(), ApiError> {
        let token_hash = self.token_hash().await?;
        let cmd = format!("jdev/sys/refreshjwt/{token_hash}/{}", self.config.username);
        let response = self.send_encrypted(&cmd).await?;
        if response.ll.code != "200" {
            return Err(ApiError::TokenRefused {
                code: response.ll.code.clone(),
                detail: response.ll.value.to_string(),
            });
        }
        self.store_token(&response)
    }

    /// Ask the controller whether the token is still valid. Not driven by
    /// any timer; kept for diagnostics.
    pub async fn check_token(&mut self) -> Result<(), ApiError> {
        let token_hash = self.token_hash().await?;
        let cmd = format!("jdev/sys/checktoken/{token_hash}/{}", self.config.username);
        let response = self.send_encrypted(&cmd).await?;
        response.expect_ok()?;
        self.store_token(&response)
    }

    // ── Encrypted command channel ────────────────────────────────────

    /// Wrap a command for the encrypted channel: salted cleartext with a
    /// trailing NUL, PKCS#5 pad when not block-aligned, AES-CBC, base64,
    /// query-escape, and send as `jdev/sys/enc/...`.
    ///
    /// The 2-byte salt is generated once and reused for the session.
    pub async fn send_encrypted(&mut self, cmd: &str) -> Result<ControlResponse, ApiError> {
        let salt = match self.command_salt {
            Some(salt) => salt,
            None => {
                let mut salt = [0u8; 2];
                rand::thread_rng().fill_bytes(&mut salt);
                self.command_salt = Some(salt);
                debug!("command salt generated");
                salt
            }
        };

        self.ensure_session_key()?;
        let key = self.aes_key.ok_or(ApiError::NotConnected)?;
        let iv = self.aes_iv.ok_or(ApiError::NotConnected)?;

        let mut cleartext = format!("salt/{}/{cmd}\0", hex::encode_upper(salt)).into_bytes();
        if cleartext.len() % AES_BLOCK != 0 {
            cleartext = crypto::pkcs5_pad(&cleartext, AES_BLOCK);
        }
        let ciphertext = crypto::aes_cbc_encrypt(&key, &iv, &cleartext)?;

        let encoded = BASE64.encode(ciphertext);
        let escaped: String = url::form_urlencoded::byte_serialize(encoded.as_bytes()).collect();
        self.transport()?
            .request_control(&format!("jdev/sys/enc/{escaped}"))
            .await
    }

    // ── Session services ─────────────────────────────────────────────

    /// Fetch and parse the structure file over the binary channel.
    pub async fn fetch_structure(&self) -> Result<serde_json::Value, ApiError> {
        let data = self.transport()?.request_binary("data/LoxApp3.json").await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Turn on binary status broadcasts and start the keep-alive task.
    pub async fn enable_updates(&self) -> Result<(), ApiError> {
        let response = self
            .transport()?
            .request_control("jdev/sps/enablebinstatusupdate")
            .await?;
        response.expect_ok()?;
        self.transport()?.start_keepalive();
        Ok(())
    }

    /// Send a ready-shaped control command. A non-200 reply is logged but
    /// does not fail the caller; the controller stays healthy either way.
    pub async fn send_command(&self, cmd: &str) -> Result<(), ApiError> {
        let response = self.transport()?.request_control(cmd).await?;
        if response.ll.code != "200" {
            warn!(code = %response.ll.code, command = cmd, "controller refused command");
        } else {
            debug!(command = cmd, "command acknowledged");
        }
        Ok(())
    }
}

/// The password proof sent with `getjwt`:
/// `UPPER_HEX(HMAC(userKey, user ":" UPPER_HEX(H(password ":" salt))))`.
fn credential_hash(
    alg: HashAlg,
    user_key: &[u8],
    username: &str,
    password: &str,
    salt: &str,
) -> Result<String, ApiError> {
    let password_hash = crypto::hash_upper_hex(alg, format!("{password}:{salt}").as_bytes());
    crypto::hmac_upper_hex(
        alg,
        user_key,
        format!("{username}:{password_hash}").as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_for(address: String) -> ControllerSession {
        ControllerSession::new(SessionConfig {
            address,
            username: "u".into(),
            password: SecretString::from("p".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn epoch_offset_lands_on_2029() {
        // 631152000 seconds past the 2009 epoch is 2029-01-01T00:00:00Z.
        let expiry = controller_epoch() + chrono::Duration::seconds(631_152_000);
        assert_eq!(expiry, Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn store_token_computes_absolute_expiry() {
        let mut session = session_for("127.0.0.1:80".into());
        let response: ControlResponse = serde_json::from_value(json!({
            "LL": {
                "Code": "200",
                "Control": "jdev/sys/getjwt/...",
                "Value": { "token": "T", "validUntil": 631152000 }
            }
        }))
        .unwrap();

        session.store_token(&response).unwrap();
        assert_eq!(session.token.as_deref(), Some("T"));
        assert_eq!(
            session.token_expiry(),
            Some(Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn credential_hash_is_upper_hex_and_salted() {
        let a = credential_hash(HashAlg::Sha256, b"key", "user", "pw", "salt1").unwrap();
        let b = credential_hash(HashAlg::Sha256, b"key", "user", "pw", "salt2").unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));

        // Deterministic for fixed inputs.
        assert_eq!(
            a,
            credential_hash(HashAlg::Sha256, b"key", "user", "pw", "salt1").unwrap()
        );
    }

    #[test]
    fn credential_hash_sha1_is_shorter() {
        let hash = credential_hash(HashAlg::Sha1, b"key", "user", "pw", "salt").unwrap();
        assert_eq!(hash.len(), 40);
    }

    #[tokio::test]
    async fn fetch_api_key_fixes_single_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jdev/cfg/apiKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LL": {
                    "Code": "200",
                    "value": "{'snr': 'AA:BB:CC:DD:EE:FF', 'version': '12.0.2.24', 'key': 'abcdef'}"
                }
            })))
            .mount(&server)
            .await;

        let mut session = session_for(server.address().to_string());
        session.fetch_api_key().await.unwrap();
        assert_eq!(session.api_key.as_deref(), Some("abcdef"));
    }

    #[tokio::test]
    async fn fetch_value_rejects_non_200_envelope_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jdev/cfg/apiKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LL": { "Code": "401", "value": "" }
            })))
            .mount(&server)
            .await;

        let mut session = session_for(server.address().to_string());
        assert!(matches!(
            session.fetch_api_key().await,
            Err(ApiError::ControlStatus { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_value_rejects_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jdev/sys/getPublicKey"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut session = session_for(server.address().to_string());
        assert!(matches!(
            session.fetch_public_key().await,
            Err(ApiError::HttpStatus { status: 404 })
        ));
    }

    #[tokio::test]
    async fn fetch_public_key_accepts_the_house_pem() {
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let mangled = pem.replace('\n', "").replace("PUBLIC KEY", "CERTIFICATE");

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jdev/sys/getPublicKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "LL": { "Code": "200", "value": mangled }
            })))
            .mount(&server)
            .await;

        let mut session = session_for(server.address().to_string());
        session.fetch_public_key().await.unwrap();
        assert_eq!(session.public_key, Some(private.to_public_key()));
    }

    #[test]
    fn session_key_material_is_created_once() {
        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let mut session = session_for("127.0.0.1:80".into());
        session.public_key = Some(private.to_public_key());

        session.ensure_session_key().unwrap();
        let key = session.aes_key;
        let sealed = session.sealed_session_key.clone();

        session.ensure_session_key().unwrap();
        assert_eq!(session.aes_key, key);
        assert_eq!(session.sealed_session_key, sealed);

        // The sealed blob opens to "<hexkey>:<hexiv>".
        let opened = private
            .decrypt(
                rsa::Pkcs1v15Encrypt,
                &BASE64.decode(sealed.unwrap()).unwrap(),
            )
            .unwrap();
        let opened = String::from_utf8(opened).unwrap();
        let (key_hex, iv_hex) = opened.split_once(':').unwrap();
        assert_eq!(hex::decode(key_hex).unwrap(), session.aes_key.unwrap());
        assert_eq!(hex::decode(iv_hex).unwrap(), session.aes_iv.unwrap());
    }
}
