// Diagnostics go to stderr, tagged with the source line that produced them.
// When we're sitting behind the core-pattern pipe there's no terminal to talk
// to, so the dispatcher is expected to redirect stderr to a log file.

#[macro_export]
macro_rules! log_line {
    ($($arg:tt)*) => (
        eprintln!("[{}:{}] {}", file!(), line!(), format_args!($($arg)*))
    );
}
