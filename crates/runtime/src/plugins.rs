//! External scheme collaborators
//!
//! The runtime implements only the `tcp://` wire. Every other endpoint
//! scheme (`file://`, `rtsp://`, `webcam://`, ...) is routed to a
//! registered plugin: `open` turns a source endpoint into a frame
//! stream, `write` accepts output frames. Plugins live outside this
//! crate; filters that need none run with an empty registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use openfilter_core::endpoint::{Endpoint, EndpointOptions};
use openfilter_core::frame::Frame;
use openfilter_core::{Error, Result};

/// Output half of an external scheme
pub trait ExternalWriter: Send + Sync {
    /// Accept one frame
    fn write(&mut self, frame: Frame) -> Result<()>;

    /// Flush and release; called once on shutdown
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One external scheme implementation
pub trait ExternalPlugin: Send + Sync + std::fmt::Debug {
    /// Scheme this plugin serves, lowercase without `://`
    fn scheme(&self) -> &str;

    /// Open a source endpoint as a frame stream.
    ///
    /// The plugin owns pacing and reconnection; dropping the receiver
    /// must stop the underlying reader.
    fn open(
        &self,
        endpoint: &Endpoint,
        options: &EndpointOptions,
    ) -> Result<mpsc::Receiver<Frame>>;

    /// Open an output endpoint as a writer
    fn write(
        &self,
        endpoint: &Endpoint,
        options: &EndpointOptions,
    ) -> Result<Box<dyn ExternalWriter>>;
}

/// Scheme-indexed plugin registry, shared by all filters of a launch
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn ExternalPlugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("schemes", &self.plugins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        PluginRegistry::default()
    }

    /// Register a plugin; replacing an existing scheme fails
    pub fn register(&mut self, plugin: Arc<dyn ExternalPlugin>) -> Result<()> {
        let scheme = plugin.scheme().to_ascii_lowercase();
        if self.plugins.contains_key(&scheme) {
            return Err(Error::config(
                "duplicate-plugin",
                format!("scheme {scheme:?} already registered"),
            ));
        }
        self.plugins.insert(scheme, plugin);
        Ok(())
    }

    /// Plugin for a scheme
    pub fn get(&self, scheme: &str) -> Result<&Arc<dyn ExternalPlugin>> {
        self.plugins.get(scheme).ok_or_else(|| {
            Error::config(
                "unsupported-scheme",
                format!("no plugin registered for scheme {scheme:?}"),
            )
        })
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.plugins.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NullPlugin;

    impl ExternalPlugin for NullPlugin {
        fn scheme(&self) -> &str {
            "file"
        }

        fn open(
            &self,
            _endpoint: &Endpoint,
            _options: &EndpointOptions,
        ) -> Result<mpsc::Receiver<Frame>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        fn write(
            &self,
            _endpoint: &Endpoint,
            _options: &EndpointOptions,
        ) -> Result<Box<dyn ExternalWriter>> {
            struct Sink;
            impl ExternalWriter for Sink {
                fn write(&mut self, _frame: Frame) -> Result<()> {
                    Ok(())
                }
            }
            Ok(Box::new(Sink))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(NullPlugin)).unwrap();
        assert!(registry.get("file").is_ok());
        let err = registry.get("s3").unwrap_err();
        assert_eq!(err.kind(), Some("unsupported-scheme"));
        assert!(registry.register(Arc::new(NullPlugin)).is_err());
        assert_eq!(registry.schemes(), vec!["file".to_string()]);
    }
}
