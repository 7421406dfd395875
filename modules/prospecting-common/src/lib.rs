pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::Config;
pub use error::{EngineError, ProviderError};
pub use events::{ProgressEvent, ProgressLevel};
pub use types::{
    Brief, BriefLocation, DiscoveryQuery, ProjectConfig, ProjectProspect, Prospect,
    ProspectStatus, RunOptions, RunSummary, ScoreBreakdown, SocialPlatform, SocialProfileMeta,
    WebsiteStatus, RELEVANCE_THRESHOLD,
};
