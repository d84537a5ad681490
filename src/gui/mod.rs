//! Terminal user interface of the `calibmonitor` binary.

mod console;
mod error;
mod layout_selector;
mod measure_screen;

pub use console::{action_for, calib_console, Action, Listening};
pub use error::CalibGuiError;
pub use layout_selector::{find_layouts, layout_selector};
pub use measure_screen::measure_screen;
