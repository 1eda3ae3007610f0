use cavern_scripts::cli::CliOverrides;
use cavern_scripts::run_with_overrides;
use env_logger::{Builder, Env};

fn main() {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed,
        Err(err) => {
            log::error!(target: "cli", "{err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run_with_overrides(cli) {
        log::error!("application error: {err:?}");
        std::process::exit(1);
    }
}
