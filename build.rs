//! Build script for the handoff broker.
//!
//! Ensures the crate is recompiled when migration files change, which the
//! `SQLx` `migrate!()` macro needs to pick up schema updates.

fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
