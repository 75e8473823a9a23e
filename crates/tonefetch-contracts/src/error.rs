use thiserror::Error;

/// Failure kinds surfaced by the tone pipeline.
///
/// Authentication and service failures during pool construction or selection
/// are fatal to the request. Download failures are recorded per model and do
/// not abort the remaining work.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no credential available before an authenticated call")]
    AuthenticationMissing,

    /// Non-success response, transport failure (status 0), or a payload that
    /// does not match the documented shape.
    #[error("{service} request failed ({status}): {detail}")]
    ServiceRequestFailed {
        service: &'static str,
        status: u16,
        detail: String,
    },

    /// Language model text that could not be recovered as a JSON object
    /// after every extraction strategy and the one stricter-prompt retry.
    #[error("language model response could not be recovered as JSON: {detail}")]
    MalformedResponse { detail: String },

    #[error("no tones matched any search query")]
    EmptyPool,

    #[error("download failed for {name}: {detail}")]
    DownloadFailed { name: String, detail: String },
}
