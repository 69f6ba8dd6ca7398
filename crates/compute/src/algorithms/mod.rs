pub mod isolation_forest;
pub mod lstm;
pub mod moments;

pub use isolation_forest::{ForestParams, IsolationForest, Verdict};
pub use lstm::{LstmLayer, LstmRegressor};
pub use moments::CentralMoments;
