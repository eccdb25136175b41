//! Two-stage pipeline: a generator feeding a logger over localhost TCP.
//!
//! ```sh
//! cargo run --example two_stage
//! ```

use serde_json::{json, Map, Value};

use openfilter_core::frame::{Frame, Image, PixelFormat};
use openfilter_core::Result;
use openfilter_runtime::filter::{Filter, FilterContext, Tick};
use openfilter_runtime::launcher::{run_multi, FilterSpec, LauncherOptions};

/// Emits a fixed number of gradient frames, then stops the pipeline
struct Generator {
    remaining: u64,
}

impl Filter for Generator {
    fn process(&mut self, ctx: &FilterContext, _tick: Tick) -> Result<Vec<Frame>> {
        if self.remaining == 0 {
            ctx.request_stop();
            return Ok(Vec::new());
        }
        self.remaining -= 1;
        std::thread::sleep(std::time::Duration::from_millis(33));

        let shade = (self.remaining % 256) as u8;
        let image = Image::new(64, 64, PixelFormat::Gray, vec![shade; 64 * 64])?;
        let mut frame = Frame::new("main").with_image(image);
        frame.meta.insert("shade".into(), Value::from(shade));
        Ok(vec![frame])
    }
}

/// Prints every frame it sees
struct Logger;

impl Filter for Logger {
    fn process(&mut self, _ctx: &FilterContext, tick: Tick) -> Result<Vec<Frame>> {
        for frame in tick.frames() {
            println!(
                "frame id={} topic={} shade={}",
                frame.id,
                frame.topic,
                frame.meta.get("shade").and_then(Value::as_u64).unwrap_or(0),
            );
        }
        Ok(Vec::new())
    }
}

fn config(v: Value) -> Map<String, Value> {
    v.as_object().unwrap().clone()
}

fn main() {
    openfilter_core::init();
    let status = run_multi(
        vec![
            FilterSpec::new(
                "Generator",
                config(json!({
                    "outputs": "tcp://127.0.0.1:5550;main",
                    "propagate_exit": true,
                })),
                || Box::new(Generator { remaining: 90 }),
            ),
            FilterSpec::new(
                "Logger",
                config(json!({
                    "sources": "tcp://127.0.0.1:5550;main",
                    "obey_exit": true,
                })),
                || Box::new(Logger),
            ),
        ],
        LauncherOptions::from_env(),
    );
    std::process::exit(status.exit_code());
}
