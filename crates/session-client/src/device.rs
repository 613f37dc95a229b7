//! Local media device seam.
//!
//! The session drives whatever encodes and decodes media through
//! [`MediaDevice`]: load it with the room router's capabilities, then ask
//! it for the receive capabilities sent with every consume and the DTLS
//! parameters used to connect transports. A WebRTC stack implements this
//! for real clients; [`mock::MockDevice`] serves tests.

use crate::errors::ClientError;
use signal_protocol::{DtlsParameters, MediaCapabilities};

/// The client's local media stack.
#[async_trait::async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the device with the room router's capabilities. Called once
    /// per join, before any transport is created.
    async fn load(&self, router_capabilities: &MediaCapabilities) -> Result<(), ClientError>;

    /// Receive capabilities sent with every consume request. Only valid
    /// after [`load`](Self::load).
    fn capabilities(&self) -> MediaCapabilities;

    /// DTLS handshake parameters for connecting transports.
    fn dtls_parameters(&self) -> DtlsParameters;
}

/// Mock device for unit and integration testing.
pub mod mock {
    use super::{ClientError, MediaCapabilities, MediaDevice};
    use signal_protocol::{DtlsFingerprint, DtlsParameters, DtlsRole};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock media device: echoes back whatever capabilities it is loaded
    /// with (optionally filtered) and counts calls.
    pub struct MockDevice {
        /// Capabilities recorded by `load`.
        loaded: Mutex<Option<MediaCapabilities>>,
        /// Number of `load` calls made.
        load_calls: AtomicUsize,
        /// Whether `load` should fail.
        fail_load: bool,
    }

    impl MockDevice {
        /// Create a mock that loads successfully.
        #[must_use]
        pub fn new() -> Self {
            Self {
                loaded: Mutex::new(None),
                load_calls: AtomicUsize::new(0),
                fail_load: false,
            }
        }

        /// Create a mock whose `load` always fails.
        #[must_use]
        pub fn failing() -> Self {
            Self {
                loaded: Mutex::new(None),
                load_calls: AtomicUsize::new(0),
                fail_load: true,
            }
        }

        /// Number of `load` calls made.
        pub fn load_calls(&self) -> usize {
            self.load_calls.load(Ordering::SeqCst)
        }
    }

    impl Default for MockDevice {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait::async_trait]
    impl MediaDevice for MockDevice {
        async fn load(&self, router_capabilities: &MediaCapabilities) -> Result<(), ClientError> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                return Err(ClientError::Device("mock device load failure".to_string()));
            }
            if let Ok(mut slot) = self.loaded.lock() {
                *slot = Some(router_capabilities.clone());
            }
            Ok(())
        }

        fn capabilities(&self) -> MediaCapabilities {
            self.loaded
                .lock()
                .ok()
                .and_then(|slot| slot.clone())
                .unwrap_or_default()
        }

        fn dtls_parameters(&self) -> DtlsParameters {
            DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "00:11:22:33".to_string(),
                }],
            }
        }
    }
}
