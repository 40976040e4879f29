use std::{io, sync::Once, thread};

use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level Debug and above.
pub fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{:?}][{}] {}",
                    thread::current().id(),
                    record.level(),
                    message
                ))
            })
            .level(level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}
