//! Build-step synthesis for the autotools convention.

use crate::suite::{BuildOptions, DEFAULT_CONFIG_OPTS};

/// Returns the build phase lines for `options`.
#[must_use]
pub fn build_lines(options: &BuildOptions) -> Vec<String> {
    let config_opts = options.config_opts.as_deref().unwrap_or(DEFAULT_CONFIG_OPTS);
    vec![
        String::from(
            "if [ ! -e configure ] && [ -x autogen.sh ]; then NOCONFIGURE=1 ./autogen.sh; fi",
        ),
        with_options("./configure", Some(config_opts)),
        with_options(
            "make all --jobs=$(getconf _NPROCESSORS_ONLN)",
            options.build_opts.as_deref(),
        ),
        with_options("make install", options.install_opts.as_deref()),
    ]
}

fn with_options(command: &str, options: Option<&str>) -> String {
    match options.map(str::trim).filter(|value| !value.is_empty()) {
        Some(extra) => format!("{command} {extra}"),
        None => command.to_owned(),
    }
}
