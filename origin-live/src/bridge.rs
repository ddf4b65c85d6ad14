//! Cross-domain bridges: adapters that ingest this source's messages into a
//! source of another protocol flavor (RTMP→RTC, TS→RTMP, ...).

use crate::message::SharedMessage;
use shared::error::Result;

/// A non-owning collaborator fed by the source on every ingest message.
/// Implementations live in the protocol crates; the source only resolves
/// them at call time.
pub trait StreamBridge: Send {
    fn name(&self) -> &str;

    fn on_publish(&mut self) -> Result<()>;

    /// One AV or metadata message. Errors are isolated by the caller.
    fn on_frame(&mut self, msg: &SharedMessage) -> Result<()>;

    fn on_unpublish(&mut self);
}
