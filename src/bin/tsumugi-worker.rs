//! Stock pool worker serving the `tsumugi.*` builtin functions.
//!
//! Point a [`ProcessPool`](tsumugi::sched::ProcessPool) at this binary when
//! the graph only uses builtins and operator nodes; hosts with their own
//! registered functions ship their own worker binary instead.

use tsumugi::Registry;
use tsumugi::worker::run_worker_stdio;

fn main() -> anyhow::Result<()> {
    #[cfg(feature = "logging")]
    tsumugi::init_logging();

    let registry = Registry::with_builtins();
    run_worker_stdio(&registry)?;
    Ok(())
}
