//! Embeds the build metadata served by `/version`.

use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder, RustcBuilder};

/// Git keys read by `src/version.rs`, with the value used outside a checkout.
const GIT_KEYS: [(&str, &str); 4] = [
    ("VERGEN_GIT_SHA", "unknown"),
    ("VERGEN_GIT_BRANCH", "unknown"),
    ("VERGEN_GIT_COMMIT_TIMESTAMP", "unknown"),
    ("VERGEN_GIT_DIRTY", "false"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut emitter = Emitter::default();
    emitter
        .add_instructions(&BuildBuilder::all_build()?)?
        .add_instructions(&CargoBuilder::all_cargo()?)?
        .add_instructions(&RustcBuilder::all_rustc()?)?;

    match GitclBuilder::all_git() {
        Ok(git) => {
            emitter.add_instructions(&git)?;
        }
        Err(_) => {
            for (key, default) in GIT_KEYS {
                let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
                println!("cargo::rustc-env={key}={value}");
                println!("cargo::rerun-if-env-changed={key}");
            }
        }
    }

    emitter.emit()?;
    Ok(())
}
