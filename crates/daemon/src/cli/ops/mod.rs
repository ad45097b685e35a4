pub mod daemon;
pub mod dot;
pub mod health;
pub mod version;

pub use daemon::Daemon;
pub use dot::Dot;
pub use health::Health;
pub use version::Version;
