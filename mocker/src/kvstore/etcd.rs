use std::{fs, path::Path, sync::Mutex};

use anyhow::Context as _;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header::AUTHORIZATION, Certificate, Identity, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Error, KvStore};
use crate::config::{Credentials, EtcdConfig};

/// Message etcd answers with once an auth token expired.
const INVALID_AUTH_TOKEN: &str = "invalid auth token";

/// Error body of the gateway. Depending on the etcd version either field, or
/// both, carry the message.
#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    message: Option<String>,
}

/// Client of the etcd v3 JSON gateway.
pub struct EtcdHttpClient {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<Credentials>,
    token: Mutex<Option<String>>,
}

impl EtcdHttpClient {
    /// Build a client trusting `cfg.ca` and presenting `cfg.client_cert`, if set.
    pub fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca) = &cfg.ca {
            let ca = Certificate::from_pem(&read_pem(ca)?)
                .with_context(|| format!("invalid CA certificate {}", ca.display()))?;
            builder = builder.add_root_certificate(ca);
        }
        if let Some(client_cert) = &cfg.client_cert {
            let mut pem = read_pem(&client_cert.cert)?;
            pem.push(b'\n');
            pem.extend(read_pem(&client_cert.key)?);
            let identity = Identity::from_pem(&pem).with_context(|| {
                format!(
                    "invalid client certificate {} or key {}",
                    client_cert.cert.display(),
                    client_cert.key.display()
                )
            })?;
            builder = builder.identity(identity);
        }
        Ok(Self {
            client: builder.build().context("failed to build the etcd client")?,
            endpoint: cfg.endpoint.trim_end_matches('/').to_owned(),
            credentials: cfg.credentials.clone(),
            token: Mutex::new(None),
        })
    }

    async fn call<B: Serialize>(
        &self,
        op: &'static str,
        key: &str,
        path: &str,
        body: &B,
    ) -> Result<(), Error> {
        let token = self.token().await?;
        let res = self.post(op, key, path, body, token.as_deref()).await;
        match (&self.credentials, res) {
            (Some(credentials), Err(Error::Rejected { message, .. }))
                if message.contains(INVALID_AUTH_TOKEN) =>
            {
                debug!(op, "auth token expired, authenticating again");
                let token = self.authenticate(credentials).await?;
                self.post(op, key, path, body, Some(token.as_str())).await?;
                Ok(())
            }
            (_, res) => res.map(|_| ()),
        }
    }

    async fn post<B: Serialize>(
        &self,
        op: &'static str,
        key: &str,
        path: &str,
        body: &B,
        token: Option<&str>,
    ) -> Result<Response, Error> {
        let mut req = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(body);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await?;
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .ok()
            .and_then(|data| data.message.or(data.error))
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| format!("{status}: {}", text.trim()));
        Err(Error::Rejected {
            op,
            key: key.to_owned(),
            message,
        })
    }

    /// Current auth token, fetching one on first use. `None` without credentials.
    async fn token(&self) -> Result<Option<String>, Error> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        let cached = self
            .token
            .lock()
            .expect("should be able to acquire lock")
            .clone();
        match cached {
            Some(token) => Ok(Some(token)),
            None => self.authenticate(credentials).await.map(Some),
        }
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<String, Error> {
        #[derive(Serialize)]
        struct Authenticate<'a> {
            name: &'a str,
            password: &'a str,
        }
        #[derive(Deserialize)]
        struct AuthenticateResponse {
            token: String,
        }

        let body = Authenticate {
            name: &credentials.username,
            password: credentials.password.expose(),
        };
        let resp = self
            .post(
                "authenticate",
                &credentials.username,
                "/v3/auth/authenticate",
                &body,
                None,
            )
            .await?;
        let data: AuthenticateResponse = resp.json().await?;
        debug!(user = %credentials.username, "authenticated to etcd");
        *self.token.lock().expect("should be able to acquire lock") = Some(data.token.clone());
        Ok(data.token)
    }
}

fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

#[async_trait]
impl KvStore for EtcdHttpClient {
    async fn update(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        #[derive(Serialize)]
        struct Put {
            key: String,
            value: String,
        }
        let body = Put {
            key: STANDARD.encode(key),
            value: STANDARD.encode(value),
        };
        self.call("update", key, "/v3/kv/put", &body).await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        #[derive(Serialize)]
        struct DeleteRange {
            key: String,
        }
        let body = DeleteRange {
            key: STANDARD.encode(key),
        };
        self.call("delete", key, "/v3/kv/deleterange", &body).await
    }

    async fn user_enforce_presence(&self, user: &str, roles: &[String]) -> Result<(), Error> {
        #[derive(Serialize)]
        struct UserOptions {
            no_password: bool,
        }
        #[derive(Serialize)]
        struct UserAdd<'a> {
            name: &'a str,
            options: UserOptions,
        }
        #[derive(Serialize)]
        struct GrantRole<'a> {
            user: &'a str,
            role: &'a str,
        }

        let add = UserAdd {
            name: user,
            options: UserOptions { no_password: true },
        };
        match self.call("user add", user, "/v3/auth/user/add", &add).await {
            Err(Error::Rejected { message, .. }) if message.contains("already exists") => {
                debug!(user, "user already present");
            }
            res => res?,
        }

        for role in roles {
            let grant = GrantRole { user, role };
            self.call("role grant", user, "/v3/auth/user/grant", &grant).await?;
        }
        Ok(())
    }
}
