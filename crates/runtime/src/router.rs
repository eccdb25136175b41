//! Output topic router
//!
//! After `process` returns, every produced frame is matched against the
//! filter's output declarations: the first matching topic rule per
//! output rewrites the topic and the frame is published there. A frame
//! matching no rule anywhere is dropped with a once-per-run warning.

use std::collections::HashSet;

use openfilter_core::endpoint::TopicMap;
use openfilter_core::frame::Frame;
use openfilter_core::Result;
use openfilter_transport::Producer;

use crate::plugins::ExternalWriter;

/// One output endpoint with its topic rules
pub enum RouteSink {
    /// Built-in wire producer
    Wire(Producer),
    /// External collaborator writer
    External(Box<dyn ExternalWriter>),
}

/// An output endpoint bound to its publish rules
pub struct OutputRoute {
    /// Where matching frames go
    pub sink: RouteSink,
    /// Publish list with rewrites; `*` forwards everything
    pub maps: Vec<TopicMap>,
}

/// Routes produced frames to output endpoints
pub struct Router {
    routes: Vec<OutputRoute>,
    unrouted_warned: HashSet<String>,
    frames_out: u64,
}

impl Router {
    /// Build over bound outputs
    pub fn new(routes: Vec<OutputRoute>) -> Self {
        Router {
            routes,
            unrouted_warned: HashSet::new(),
            frames_out: 0,
        }
    }

    /// Whether any route exists
    pub fn has_routes(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Frames published so far
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Publish one produced frame to every matching output.
    ///
    /// Blocks under downstream backpressure. Unroutable frames are
    /// dropped with a once-per-run warning per topic.
    pub async fn route(&mut self, frame: Frame) -> Result<()> {
        let mut published = false;
        for route in &mut self.routes {
            let dst = route
                .maps
                .iter()
                .find_map(|map| map.apply(&frame.topic));
            let Some(dst) = dst else { continue };
            let mut outgoing = frame.clone();
            if outgoing.topic != dst {
                outgoing.topic = dst;
                outgoing.sync_runtime_meta();
            }
            match &mut route.sink {
                RouteSink::Wire(producer) => producer.publish(outgoing).await?,
                RouteSink::External(writer) => writer.write(outgoing)?,
            }
            published = true;
        }
        if published {
            self.frames_out += 1;
        } else if self.unrouted_warned.insert(frame.topic.clone()) {
            tracing::warn!(
                topic = %frame.topic,
                "produced frame matches no output rule, dropping"
            );
        }
        Ok(())
    }

    /// Flush wire outputs, bounded by `timeout`
    pub async fn flush(&self, timeout: std::time::Duration) {
        for route in &self.routes {
            if let RouteSink::Wire(producer) = &route.sink {
                producer.flush(timeout).await;
            }
        }
    }

    /// Send end-of-stream on every published topic.
    ///
    /// Flushes afterwards so the announcements reach the wire before the
    /// listeners close.
    pub async fn finish(&mut self) {
        for route in &mut self.routes {
            match &mut route.sink {
                RouteSink::Wire(producer) => producer.send_eos_all().await,
                RouteSink::External(writer) => {
                    if let Err(e) = writer.close() {
                        tracing::warn!(error = %e, "external writer close failed");
                    }
                }
            }
        }
        self.flush(std::time::Duration::from_secs(2)).await;
    }

    /// Close wire listeners
    pub fn close(&self) {
        for route in &self.routes {
            if let RouteSink::Wire(producer) = &route.sink {
                producer.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openfilter_transport::ProducerConfig;

    #[tokio::test]
    async fn test_rewrite_and_unrouted_warning() {
        let producer = Producer::bind("127.0.0.1", 0, "F", "run", ProducerConfig::default())
            .await
            .unwrap();
        let mut router = Router::new(vec![OutputRoute {
            sink: RouteSink::Wire(producer),
            maps: vec![TopicMap {
                src: "a".into(),
                dst: "main".into(),
            }],
        }]);

        router.route(Frame::new("a")).await.unwrap();
        assert_eq!(router.frames_out(), 1);

        // unmatched topic: dropped, warned once
        router.route(Frame::new("b")).await.unwrap();
        router.route(Frame::new("b")).await.unwrap();
        assert_eq!(router.frames_out(), 1);
        assert_eq!(router.unrouted_warned.len(), 1);
    }
}
