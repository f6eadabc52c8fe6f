pub mod attribute;
pub mod cache;
pub mod decode;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod locator;
pub mod payload;
pub mod resources;
pub mod scheduler;
pub mod sink;
pub mod transform;

pub use attribute::{CacheKey, DisplayPolicy, ImageAttributes, PoolPolicy, ResizeMode, ScaleMode};
pub use engine::{EngineBuilder, EngineConfig, ImageEngine};
pub use error::{Error, Result};
pub use locator::{SourceKind, SourceLocator};
pub use payload::ImageBuf;
pub use resources::{PlatformResources, ResourceId, StaticResources};
pub use sink::{BindingGuard, BufferSink, Sink};

pub use dispatch::CompletionListener;
pub use scheduler::PoolOrdering;
pub use transform::{FilterRegistry, ImageFilter};
