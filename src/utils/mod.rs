use std::sync::Once;

static LOG_INIT: Once = Once::new();

/// Set up the process-wide logger. Safe to call from every test.
pub fn init_log() {
    LOG_INIT.call_once(|| {
        use std::io::Write;

        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("<unknown>"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}
