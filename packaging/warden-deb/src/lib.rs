//! Packaging-only crate; the Debian manifest lives in `Cargo.toml`.
