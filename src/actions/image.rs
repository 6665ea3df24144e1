//! Image manipulation workers and the blur chain that strings them together.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use crate::actions::Worker;
use crate::dsl::ChainSpec;
use crate::dsl::builder::ChainBuilder;
use crate::image::ImageStore;
use crate::runtime::chain::ExistingChainPolicy;
use crate::runtime::constraint::Constraint;
use crate::runtime::context::WorkContext;
use crate::runtime::task::Data;

pub const IMAGE_MANIPULATION_WORK_NAME: &str = "image_manipulation_work";
pub const KEY_IMAGE_URI: &str = "KEY_IMAGE_URI";
pub const TAG_OUTPUT: &str = "OUTPUT";
pub const TAG_PROGRESS: &str = "PROGRESS";
pub const OUTPUT_PATH: &str = "blur_filter_outputs";
pub const SAVED_PATH: &str = "saved";

fn image_uri(input: &Data) -> Result<&str> {
    input
        .get(KEY_IMAGE_URI)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Missing required input: {}", KEY_IMAGE_URI))
}

fn single(key: &str, value: String) -> Data {
    Data::from([(key.to_string(), Value::String(value))])
}

async fn pause(delay: Duration, ctx: &WorkContext) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ctx.cancelled() => {}
    }
}

/// Removes temporary images left by earlier blur runs. Outputs `removed`.
#[derive(Debug)]
pub struct CleanupWorker {
    store: Arc<dyn ImageStore>,
}

impl CleanupWorker {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Worker for CleanupWorker {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn execute(&self, _input: Data, ctx: &WorkContext) -> Result<Data> {
        let prefix = format!("{}/", OUTPUT_PATH);
        let stale = self.store.list(&prefix).await?;
        let mut removed = 0u64;
        for locator in stale.iter().filter(|l| l.ends_with(".png")) {
            ctx.checkpoint()?;
            self.store.remove(locator).await?;
            removed += 1;
        }
        info!(removed, "Cleaned up temporary images");
        Ok(Data::from([("removed".to_string(), Value::from(removed))]))
    }
}

/// One blur pass over the image named by `KEY_IMAGE_URI`.
#[derive(Debug)]
pub struct BlurWorker {
    store: Arc<dyn ImageStore>,
    delay: Duration,
}

impl BlurWorker {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
        }
    }

    /// Artificial delay so progress is visible to observers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// 3-tap box blur over a raw 8-bit buffer. Edges reuse the border byte.
pub fn box_blur(pixels: &[u8]) -> Vec<u8> {
    let n = pixels.len();
    (0..n)
        .map(|i| {
            let left = pixels[i.saturating_sub(1)] as u16;
            let right = pixels[(i + 1).min(n - 1)] as u16;
            let sum = left + pixels[i] as u16 + right;
            ((sum + 1) / 3) as u8
        })
        .collect()
}

#[async_trait]
impl Worker for BlurWorker {
    fn name(&self) -> &str {
        "blur"
    }

    fn validate(&self, input: &Data) -> Result<()> {
        image_uri(input).map(|_| ())
    }

    async fn execute(&self, input: Data, ctx: &WorkContext) -> Result<Data> {
        let source = image_uri(&input)?;
        pause(self.delay, ctx).await;
        ctx.checkpoint()?;

        let pixels = self.store.read(source).await?;
        let blurred = box_blur(&pixels);
        ctx.checkpoint()?;

        let target = format!("{}/blur-filter-output-{}.png", OUTPUT_PATH, Uuid::new_v4());
        self.store.write(&target, &blurred).await?;
        info!(source, target = %target, position = ctx.position, "Blurred image");
        Ok(single(KEY_IMAGE_URI, target))
    }
}

/// Copies the final image out of the temporary area.
#[derive(Debug)]
pub struct SaveImageWorker {
    store: Arc<dyn ImageStore>,
    delay: Duration,
}

impl SaveImageWorker {
    pub fn new(store: Arc<dyn ImageStore>) -> Self {
        Self {
            store,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Worker for SaveImageWorker {
    fn name(&self) -> &str {
        "save"
    }

    fn validate(&self, input: &Data) -> Result<()> {
        image_uri(input).map(|_| ())
    }

    async fn execute(&self, input: Data, ctx: &WorkContext) -> Result<Data> {
        let source = image_uri(&input)?;
        pause(self.delay, ctx).await;
        ctx.checkpoint()?;

        let pixels = self.store.read(source).await?;
        let target = format!("{}/blurred-{}.png", SAVED_PATH, Uuid::new_v4());
        self.store.write(&target, &pixels).await?;
        info!(target = %target, "Saved image");
        Ok(single(KEY_IMAGE_URI, target))
    }
}

/// Cleanup, `blur_level` blur passes, then a save that waits for charging.
/// Replaces any blur chain already in flight.
pub fn blur_chain(image_uri: &str, blur_level: usize) -> ChainSpec {
    let mut builder = ChainBuilder::new(IMAGE_MANIPULATION_WORK_NAME)
        .policy(ExistingChainPolicy::Replace)
        .then("cleanup");

    for i in 0..blur_level {
        let mut task = builder.task("blur").requires(KEY_IMAGE_URI).produces(KEY_IMAGE_URI);
        // Later passes take the previous pass's output.
        if i == 0 {
            task = task.input(KEY_IMAGE_URI, image_uri);
        }
        builder = task.tag(TAG_PROGRESS).build();
    }

    let mut save = builder.task("save");
    if blur_level == 0 {
        save = save.input(KEY_IMAGE_URI, image_uri);
    }
    save.requires(KEY_IMAGE_URI)
        .produces(KEY_IMAGE_URI)
        .constraint(Constraint::RequiresCharging)
        .tag(TAG_OUTPUT)
        .build()
        .build()
}
