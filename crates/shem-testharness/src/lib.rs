//! ---
//! shem_section: "06-test-harness"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Fixtures shared by orchestrator integration tests."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! Test fixtures for exercising the orchestrator without podman or a real
//! `$SHEM_HOME`: [`TempHome`] builds throwaway module trees on disk and
//! [`MemorySandbox`] substitutes the container runtime, handing tests the
//! far ends of each spawned module's stdio streams.

mod home;
mod sandbox;

pub use home::{ModuleBuilder, TempHome};
pub use sandbox::{MemorySandbox, ModulePeer};
