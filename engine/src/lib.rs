// epidyn — compartmental dynamic simulation engine
//
// Runs Markov-chain-like compartment networks (a framework) against
// per-population calibration data (a parameter set), optionally under
// program-driven parameter overwrites, producing trajectories for every
// compartment, parameter, and characteristic on a fixed time grid.

pub mod characteristic;
pub mod compartment;
pub mod dot;
pub mod error;
pub mod expr;
pub mod framework;
pub mod id;
mod init;
pub mod lexer;
pub mod link;
pub mod model;
pub mod parameter;
pub mod parset;
pub mod population;
pub mod programs;
pub mod result;
pub mod scenario;
pub mod settings;
pub mod timeseries;

pub use error::{EngineError, Result};
pub use framework::{
    CascadeSpec, CharacteristicSpec, CompartmentSpec, Framework, InteractionSpec, ParamFormat,
    ParameterSpec,
};
pub use model::Model;
pub use parset::{ParameterSet, PopDef};
pub use programs::{Covout, Program, ProgramInstructions, ProgramSet};
pub use result::{compute_provenance, run, run_with, Provenance, Series, SimResult};
pub use scenario::ParameterScenario;
pub use settings::{CancelToken, Settings};
pub use timeseries::TimeSeries;
