/// Resolved at build time; the Rust analogue of the git-describe version
/// string computed at runtime elsewhere, since a built binary has no
/// repository to introspect (11.2).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
