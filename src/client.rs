use backoff::{backoff::Backoff, ExponentialBackoff};
use log::info;
use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use thiserror::Error;
use tokio::time::sleep;

static USER_AGENT: &str = "walle";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    username: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_credentials<U: Into<String>, T: Into<String>>(username: U, token: T) -> Self {
        ApiClient::new(username.into(), Some(token.into()))
    }

    fn new(username: String, token: Option<String>) -> Self {
        let client = ClientBuilder::new().user_agent(USER_AGENT).build().unwrap();
        Self {
            client,
            username,
            token,
        }
    }

    pub async fn get<O>(&self, endpoint: &str) -> Result<O>
    where
        O: DeserializeOwned,
    {
        retry_request_if_needed(|| {
            let builder = self.client.get(endpoint);
            self.submit_json(builder)
        })
        .await
    }

    pub async fn post_for_status<I>(&self, endpoint: &str, body: &I) -> Result<StatusCode>
    where
        I: Serialize,
    {
        retry_request_if_needed(|| {
            let builder = self.client.post(endpoint).json(body);
            self.submit_for_status(builder)
        })
        .await
    }

    pub async fn put_for_status<I>(&self, endpoint: &str, body: &I) -> Result<StatusCode>
    where
        I: Serialize,
    {
        retry_request_if_needed(|| {
            let builder = self.client.put(endpoint).json(body);
            self.submit_for_status(builder)
        })
        .await
    }

    pub async fn delete_for_status(&self, endpoint: &str) -> Result<StatusCode> {
        retry_request_if_needed(|| {
            let builder = self.client.delete(endpoint);
            self.submit_for_status(builder)
        })
        .await
    }

    async fn submit_json<O>(&self, builder: RequestBuilder) -> Result<O>
    where
        O: DeserializeOwned,
    {
        let builder = builder.basic_auth(&self.username, self.token.as_ref());
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Error::Http(response.status()))
        }
    }

    async fn submit_for_status(&self, builder: RequestBuilder) -> Result<StatusCode> {
        let builder = builder.basic_auth(&self.username, self.token.as_ref());
        let response = builder.send().await?;
        if response.status().is_success() {
            Ok(response.status())
        } else {
            Err(Error::Http(response.status()))
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("rate limited max attempts reached")]
    RateLimitRetries,

    #[error("request failed with status code {0}")]
    Http(StatusCode),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    pub fn not_found(&self) -> bool {
        matches!(self, Self::Http(StatusCode::NOT_FOUND))
    }

    pub fn conflict(&self) -> bool {
        matches!(self, Self::Http(StatusCode::CONFLICT))
    }

    pub fn too_many_requests(&self) -> bool {
        matches!(self, Self::Http(StatusCode::TOO_MANY_REQUESTS))
    }
}

async fn retry_request_if_needed<F, R, O>(requestor: F) -> Result<O>
where
    F: Fn() -> R,
    R: Future<Output = Result<O>>,
{
    // TODO: make the backoff policy configurable
    let mut backoff = ExponentialBackoff::default();
    loop {
        match requestor().await {
            Err(e) if e.too_many_requests() => {
                let delay = backoff.next_backoff();
                match delay {
                    Some(delay) => {
                        info!("Rate limit hit, sleeping for {}s", delay.as_secs());
                        sleep(delay).await
                    }
                    None => return Err(Error::RateLimitRetries),
                }
            }
            other => return other,
        }
    }
}
