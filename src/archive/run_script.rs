//! The `run.sh` entry point executed after extraction.

use crate::mount::{Mount, RUN_PID_VAR};
use crate::script::{ScriptBuilder, quote};

use super::output::SENTINEL;

/// File name of the generated run script.
pub const RUN_SCRIPT: &str = "run.sh";

/// Renders `run.sh`: mount extraction in construction order, search-path
/// exports, the sentinel, then the payload with CLI passthrough.
pub(crate) fn render_run_script(
    mounts: &[Mount],
    payload: &str,
    verbose: bool,
    search_path_var: &str,
) -> ScriptBuilder {
    let mut script = ScriptBuilder::new();
    script.line(format!("{RUN_PID_VAR}=$$; export {RUN_PID_VAR}"));
    if verbose {
        script
            .echo("satchel bundle")
            .line("cat ./METADATA")
            .line("echo \"cli args: $*\"");
    }

    for mount in mounts {
        if verbose {
            script.echo(&format!("Mounting {}", mount.name()));
        }
        script.line(format!("{} || exit 1", mount.extract_command()));
        if let Some(entry) = mount.search_path_entry() {
            script.line(format!(
                "export {search_path_var}=\"${search_path_var}\":{}",
                quote(entry.as_str())
            ));
        }
    }

    script.echo(SENTINEL);
    script.line(format!("{payload} \"$@\""));
    script
}
