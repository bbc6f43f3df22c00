pub mod bench;
pub mod callback;
pub mod clock;
pub mod config;
pub mod error;
pub mod hal;
pub mod job;
pub mod logger;
pub mod output;
pub mod plotting;
pub mod pulse_generator;
pub mod pulse_train;
pub mod registry;
pub mod sis38xx_pulser;
pub mod software_pulser;
pub mod types;
pub mod utils;

pub use bench::SoftBench;
pub use callback::{CallbackLoop, MasterTimer, OneShotTimer, DEFAULT_CALLBACK_INTERVAL};
pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use config::{load_config, load_config_or_default, AppConfig, PulserConfig};
pub use error::{ErrorKind, MxError};
pub use hal::{AddressMode, DigitalOutput, Relay, RelayCommand, RelayStatus, VmeBus};
pub use job::{Job, PulseTrainJob, TrainSummary};
pub use logger::{EventLogger, EventRecorder};
pub use output::{DigitalOutputLine, OutputLine, RelayLine};
pub use plotting::{plot_waveform, step_frame};
pub use pulse_generator::{OpenContext, PulseGenerator, PulseGeneratorCore};
pub use pulse_train::{PulseTrain, Transition};
pub use registry::{RecordHandle, Registry};
pub use sis38xx_pulser::{ModuleModel, Sis38xxPulser, VmeLocation};
pub use software_pulser::{SoftwarePulser, TransitionEvent, UpdateMode};
pub use types::{FunctionMode, Level, Parameter, PulseCount, PulseParameters, TriggerMode};
