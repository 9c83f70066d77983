pub mod config;
pub mod harness;
pub mod input;
pub mod sandbox;

pub use config::SandboxConfig;
pub use harness::{ArgvHarness, Harness, HarnessError, Invocation, ScriptHarness, TraceStream};
pub use input::TestInput;
pub use sandbox::{ExecutionOutcome, Sandbox, SandboxError};
