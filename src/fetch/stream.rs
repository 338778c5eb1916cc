//! Server-sent events subscription used to receive feature payload pushes.

use std::time::Duration;

use eventsource_client as es;
use futures::StreamExt;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::constants::STREAM_PATH;
use crate::errors::ClientError;
use crate::errors::ErrorKind::*;
use crate::fetch::fetcher::user_agent;
use crate::options::RepositoryOptions;

pub(crate) fn stream_url(api_host: &str, client_key: &str) -> String {
    format!(
        "{host}/{STREAM_PATH}/{client_key}",
        host = api_host.trim_end_matches('/')
    )
}

fn reconnect_options(options: &RepositoryOptions) -> es::ReconnectOptions {
    es::ReconnectOptions::reconnect(true)
        .retry_initial(true)
        .delay(*options.stream_initial_backoff())
        .backoff_factor(2)
        .delay_max(*options.stream_max_backoff())
        .build()
}

/// Builds the event source of `url`.
///
/// The client reconnects on its own after failures and closed connections, doubling the
/// delay up to the configured maximum, and resends the last seen event id. A connection
/// that stays silent longer than the read timeout counts as failed.
pub(crate) fn stream_client(
    url: &str,
    options: &RepositoryOptions,
) -> Result<impl es::Client, ClientError> {
    let builder = es::ClientBuilder::for_url(url)
        .and_then(|builder| builder.header("User-Agent", &user_agent()))
        .and_then(|builder| builder.header("Cache-Control", "no-cache"))
        .map_err(|err| {
            ClientError::new(
                HttpClientInitFailure,
                format!("Failed to initialize the stream client for '{url}'. {err}"),
            )
        })?;
    Ok(builder
        .connect_timeout(*options.http_timeout())
        .read_timeout(*options.stream_read_timeout())
        .reconnect(reconnect_options(options))
        .build())
}

/// Forwards the events of `client` to `on_event` until `token` is cancelled or `on_event`
/// returns `false`. An event source that gives up is rebuilt after `retry_delay`.
pub(crate) async fn run_stream<C, F>(
    client: C,
    url: String,
    retry_delay: Duration,
    token: CancellationToken,
    on_event: F,
) where
    C: es::Client,
    F: Fn(&es::Event) -> bool,
{
    loop {
        let mut events = client.stream();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                item = events.next() => match item {
                    Some(Ok(es::SSE::Connected(_))) => debug!("Stream connected to {url}"),
                    Some(Ok(es::SSE::Event(event))) => {
                        if !on_event(&event) {
                            return;
                        }
                    }
                    Some(Ok(es::SSE::Comment(_))) => {}
                    Some(Err(err)) => {
                        warn!(event_id = StreamFailure.as_u8(); "Stream connection to {url} lost. {err}");
                    }
                    None => break,
                }
            }
        }
        debug!("Stream of {url} ended, reconnecting");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(retry_delay) => {}
        }
    }
}
