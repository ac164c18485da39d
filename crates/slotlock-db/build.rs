//! Build script for embedded migrations.
//!
//! `sqlx::migrate!` reads the migrations directory at compile time, so the
//! crate has to be rebuilt whenever a migration is added or edited.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
