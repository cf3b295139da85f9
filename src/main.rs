//! Binary entry point for the `framewriter` service.
//!
//! Parses the handful of daemon options, installs the tracing subscriber,
//! starts the [`Controller`], optionally binds the control endpoint, and
//! then parks in `wait_for_shutdown` until a `shutdown` command arrives on
//! the control channel.
//!
//! Exit codes: 0 after a clean shutdown, 1 when the control reactor (or an
//! initial endpoint bind) fails to come up.

use anyhow::anyhow;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use framewriter::ipc::{IpcMessage, MsgType, MsgVal};
use framewriter::Controller;

const USAGE: &str = "\
usage: framewriter [options]
  --ctrl <endpoint>   bind the control channel (inproc://name or tcp://host:port)
  --log <level>       log filter (error|warn|info|debug|trace), default info
  -v                  shorthand for --log debug
  -q                  shorthand for --log error
  -h, --help          print this help
  -V, --version       print the version
";

struct Options {
    ctrl_endpoint: Option<String>,
    log_filter: String,
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut opts = Options {
        ctrl_endpoint: None,
        log_filter: "info".into(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--ctrl" => {
                opts.ctrl_endpoint = Some(
                    iter.next()
                        .ok_or_else(|| anyhow!("bad usage: --ctrl: expected an endpoint"))?
                        .clone(),
                );
            }
            "--log" => {
                opts.log_filter = iter
                    .next()
                    .ok_or_else(|| anyhow!("bad usage: --log: expected a level"))?
                    .clone();
            }
            "-v" => opts.log_filter = "debug".into(),
            "-q" => opts.log_filter = "error".into(),
            "-h" | "--help" => {
                print!("{USAGE}");
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("framewriter {}", framewriter::VERSION_STRING);
                return Ok(None);
            }
            other => return Err(anyhow!("bad usage: unknown option: {other}")),
        }
    }
    Ok(Some(opts))
}

fn run(opts: Options) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.log_filter.clone()));
    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_env_filter(filter).finish(),
    )
    .map_err(|e| anyhow!("logging init: {e}"))?;

    let controller = Controller::new()?;

    if let Some(endpoint) = &opts.ctrl_endpoint {
        let mut bind = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        bind.set_param("ctrl_endpoint", endpoint.clone());
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        controller.configure(&bind, &mut reply);
        if let Ok(text) = reply.get_param::<String>("error") {
            return Err(anyhow!("control endpoint setup failed: {text}"));
        }
    }

    controller.wait_for_shutdown();
    controller.stop();
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(e) => {
            eprintln!("{e}");
            eprint!("{USAGE}");
            std::process::exit(1);
        }
    };
    if let Err(e) = run(opts) {
        error!("startup failed: {e}");
        eprintln!("framewriter: {e}");
        std::process::exit(1);
    }
}
