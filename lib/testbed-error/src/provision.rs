use snafu::Snafu;

/// Errors raised while composing or provisioning a test environment.
///
/// Descriptor-construction errors (`MalformedVersion`, `UnsupportedVersion`, `InvalidOption`) abort composition
/// before any document is written. Manifest errors carry enough detail to debug a build/version mismatch by hand.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProvisionError {
    /// A version string contained no numeric component.
    #[snafu(display("Malformed version '{}': no numeric component found.", input))]
    MalformedVersion {
        /// The raw input.
        input: String,
    },

    /// A service was requested at a stack version lower than it supports.
    #[snafu(display(
        "Service '{}' does not support version {}: minimum supported version is {}.",
        service,
        version,
        minimum
    ))]
    UnsupportedVersion {
        /// Service name.
        service: String,

        /// Requested version.
        version: String,

        /// Minimum supported version.
        minimum: String,
    },

    /// A user-supplied option was invalid for the requested composition.
    #[snafu(display("Invalid option '{}': {}", option, reason))]
    InvalidOption {
        /// Option name, as the user would type it.
        option: String,

        /// Why the value was rejected.
        reason: String,
    },

    /// A build candidate index or manifest could not be fetched.
    #[snafu(display("Failed to fetch build manifest at {}: HTTP status {}.", url, status))]
    ManifestFetchFailed {
        /// Requested URL.
        url: String,

        /// HTTP status code returned, or 0 if no response was received.
        status: u16,
    },

    /// A build candidate index or manifest was fetched but could not be decoded.
    #[snafu(display("Build manifest at {} is malformed: {}", url, reason))]
    MalformedManifest {
        /// Requested URL.
        url: String,

        /// Why decoding failed.
        reason: String,
    },

    /// A build candidate manifest did not contain the expected artifact.
    #[snafu(display(
        "Artifact '{}' not found in project '{}' of the build manifest. Full manifest:\n{}",
        key,
        project,
        manifest
    ))]
    ArtifactNotFound {
        /// Manifest project that was searched.
        project: String,

        /// Artifact key (the last one tried, when several naming schemes are attempted).
        key: String,

        /// The full manifest, rendered as pretty JSON.
        manifest: String,
    },

    /// One or more images could not be fetched or loaded.
    #[snafu(display("Failed to acquire {} of {} image(s).", failed, total))]
    ImageAcquisitionFailed {
        /// Number of images that failed.
        failed: usize,

        /// Number of images attempted.
        total: usize,
    },

    /// Two services publish the same host port.
    #[snafu(display("Host port {} is published by both '{}' and '{}'.", port, first, second))]
    PortCollision {
        /// The host port, including a protocol suffix when not TCP.
        port: String,

        /// The service that claimed the port first.
        first: String,

        /// The service that tried to claim it again.
        second: String,
    },

    /// A toxic could not be applied, even after clearing the proxy and retrying.
    #[snafu(display("Failed to apply toxic '{}' to proxy '{}': {}", code, proxy, reason))]
    ToxicApplyFailed {
        /// Proxy name.
        proxy: String,

        /// Toxic code.
        code: String,

        /// Underlying failure.
        reason: String,
    },
}
