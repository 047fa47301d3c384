use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use foundry_protocol::{headers, signing, ProblemDetails, SigningInput};
use rand::RngCore;
use reqwest::blocking::{Client, Response};
use reqwest::Method;

/// HTTP client that signs every request with the shared secret.
pub struct SignedClient {
    base: String,
    secret: Vec<u8>,
    actor: Option<String>,
    http: Client,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Header set for one request; a fresh nonce and request id every call.
pub fn sign_headers(
    secret: &[u8],
    method: &str,
    path: &str,
    query: &str,
    body: &[u8],
    timestamp: i64,
) -> Result<Vec<(&'static str, String)>> {
    let body_sha256 = signing::body_sha256_hex(body);
    let nonce = random_hex(16);
    let request_id = format!("cli-{}", random_hex(6));
    let input = SigningInput {
        method: method.to_ascii_uppercase(),
        route: path.to_string(),
        query: signing::canonical_query(&signing::parse_query(query)),
        body_sha256: body_sha256.clone(),
        timestamp,
        nonce: nonce.clone(),
        request_id: request_id.clone(),
    };
    let signature = signing::sign(secret, &input).context("signing request")?;
    Ok(vec![
        (headers::SIGNATURE, signature),
        (headers::TIMESTAMP, timestamp.to_string()),
        (headers::NONCE, nonce),
        (headers::BODY_SHA256, body_sha256),
        (headers::REQUEST_ID, request_id),
    ])
}

pub fn decode_secret(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    if raw.len() != 64 {
        bail!("shared secret must be 64 hex characters");
    }
    hex::decode(raw).context("shared secret is not hex")
}

impl SignedClient {
    pub fn new(base: &str, secret_hex: &str, actor: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("foundry-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            secret: decode_secret(secret_hex)?,
            actor,
            http,
        })
    }

    pub fn send(
        &self,
        method: Method,
        path: &str,
        query: &str,
        body: Vec<u8>,
        extra: &[(&'static str, String)],
    ) -> Result<Response> {
        let signed = sign_headers(
            &self.secret,
            method.as_str(),
            path,
            query,
            &body,
            chrono::Utc::now().timestamp(),
        )?;
        let url = if query.is_empty() {
            format!("{}{path}", self.base)
        } else {
            format!("{}{path}?{query}", self.base)
        };
        let mut req = self.http.request(method, &url).body(body);
        for (name, value) in signed.iter().chain(extra) {
            req = req.header(*name, value);
        }
        if let Some(actor) = &self.actor {
            req = req.header(headers::ACTOR, actor);
        }
        let resp = req.send().with_context(|| format!("requesting {url}"))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(problem_error(resp))
    }
}

fn problem_error(resp: Response) -> anyhow::Error {
    let status = resp.status();
    match resp.json::<ProblemDetails>() {
        Ok(problem) => {
            let code = problem.code.unwrap_or_else(|| problem.title.clone());
            let detail = problem.detail.unwrap_or(problem.title);
            anyhow!("{} {code}: {detail}", status.as_u16())
        }
        Err(_) => anyhow!("request failed with status {status}"),
    }
}
