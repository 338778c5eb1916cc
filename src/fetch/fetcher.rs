use std::time::Duration;

use chrono::Utc;
use log::{debug, error};

use crate::constants::{FEATURES_PATH, PKG_VERSION};
use crate::errors::ClientError;
use crate::errors::ErrorKind::*;
use crate::fetch::fetcher::FetchResponse::{Failed, Fetched};
use crate::model::feature::{entry_from_json, FeatureEntry};

#[derive(Debug)]
pub enum FetchResponse {
    Fetched(FeatureEntry),
    Failed(ClientError),
}

pub(crate) fn user_agent() -> String {
    format!("featgate-rust/{PKG_VERSION}")
}

pub(crate) fn features_url(api_host: &str, client_key: &str) -> String {
    format!(
        "{host}/{FEATURES_PATH}/{client_key}",
        host = api_host.trim_end_matches('/')
    )
}

pub struct FeatureFetcher {
    http_client: reqwest::Client,
}

impl FeatureFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|err| {
                ClientError::new(
                    HttpClientInitFailure,
                    format!("Failed to initialize the HTTP client. {err}"),
                )
            })?;
        Ok(Self { http_client })
    }

    pub async fn fetch(&self, api_host: &str, client_key: &str) -> FetchResponse {
        let result = self
            .http_client
            .get(features_url(api_host, client_key))
            .send()
            .await;

        match result {
            Ok(response) => match response.status().as_u16() {
                200..=299 => {
                    debug!("Fetch was successful: new features fetched");
                    match response.text().await {
                        Ok(body_str) => match entry_from_json(body_str.as_str(), Utc::now()) {
                            Ok(entry) => Fetched(entry),
                            Err(parse_error) => {
                                let msg = format!("Fetching features was successful but the HTTP response content was invalid. {parse_error}");
                                error!(event_id = InvalidHttpResponseContent.as_u8(); "{}", msg);
                                Failed(ClientError::new(InvalidHttpResponseContent, msg))
                            }
                        },
                        Err(body_error) => {
                            let msg = format!("Fetching features was successful but the HTTP response content was invalid. {body_error}");
                            error!(event_id = InvalidHttpResponseContent.as_u8(); "{}", msg);
                            Failed(ClientError::new(InvalidHttpResponseContent, msg))
                        }
                    }
                }
                code @ (401 | 403 | 404) => {
                    let msg = format!("Your client key seems to be wrong. Status code: {code}");
                    error!(event_id = InvalidClientKey.as_u8(); "{}", msg);
                    Failed(ClientError::new(InvalidClientKey, msg))
                }
                code => {
                    let msg = format!("Unexpected HTTP response was received while trying to fetch features. Status code: {code}");
                    error!(event_id = UnexpectedHttpResponse.as_u8(); "{}", msg);
                    Failed(ClientError::new(UnexpectedHttpResponse, msg))
                }
            },
            Err(error) => {
                if error.is_timeout() {
                    let msg = "Request timed out while trying to fetch features.".to_owned();
                    error!(event_id = HttpRequestTimeout.as_u8(); "{}", msg);
                    Failed(ClientError::new(HttpRequestTimeout, msg))
                } else {
                    let msg = format!("Unexpected error occurred while trying to fetch features. It is most likely due to a local network issue. {error}");
                    error!(event_id = HttpRequestFailure.as_u8(); "{}", msg);
                    Failed(ClientError::new(HttpRequestFailure, msg))
                }
            }
        }
    }
}
