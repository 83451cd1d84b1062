// speedtest-worker: the measurement side of the controller <-> worker protocol.
// Depends on `speedtest-sdk` and `speedtest-common`.
//
// Architecture:
//   Worker::run (command loop) → MeasurementRun::run → per-phase
//     ip lookup / ping+jitter / download / upload

pub mod measurement;
pub mod settings;
pub mod worker;

pub use settings::WorkerSettings;
pub use worker::Worker;
