/// Describes how a [`crate::Client`] keeps its features up to date.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RefreshStrategy {
    /// Features are refreshed on [`crate::Client::load_features`] calls. Stale payloads are
    /// served while a background refresh runs.
    #[default]
    StaleWhileRevalidate,
    /// Like [`RefreshStrategy::StaleWhileRevalidate`], and additionally keeps a streaming
    /// connection open that pushes payload updates as they happen.
    ServerSentEvents,
}
