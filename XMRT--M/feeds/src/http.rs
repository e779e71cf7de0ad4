use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::error::FeedError;

pub const USER_AGENT: &str = concat!("xmrt-coordinator/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> Result<Client, FeedError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| FeedError::Transport(format!("building http client: {err}")))
}

/// GETs `url` and decodes the JSON body, bounded by `timeout` end to end.
pub async fn fetch_json<T>(
    client: &Client,
    target: &str,
    url: &str,
    timeout: Duration,
) -> Result<T, FeedError>
where
    T: DeserializeOwned,
{
    let classify = |err: reqwest::Error| FeedError::from_reqwest(target, timeout, &err);
    let body = async {
        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?
            .error_for_status()
            .map_err(classify)?;
        response.bytes().await.map_err(classify)
    };
    let bytes = tokio::time::timeout(timeout, body)
        .await
        .map_err(|_| FeedError::Timeout {
            target: target.to_string(),
            elapsed: timeout,
        })??;
    serde_json::from_slice(&bytes).map_err(|err| FeedError::Decode(format!("{target}: {err}")))
}
