use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::exit;

use structopt::StructOpt;

use muster_client::platform::{ConsoleUserResolver, SystemConsoleUser};
use muster_client::scripts::ScriptHost;
use muster_client::status::scan_applications;
use muster_client::{
    precache, Context, Executor, Fetcher, PlanError, Planner, PrefPaths, Preferences, UsageLedger,
};
use muster_types::PostAction;

// Engine exit codes.
const EXIT_NO_UPDATES: i32 = 0;
const EXIT_UPDATES_PLANNED: i32 = 1;
const EXIT_MANAGED_DIR_FAILURE: i32 = 101;
const EXIT_REPO_UNREACHABLE: i32 = 150;
const EXIT_INVALID_PARAMETERS: i32 = 200;
const EXIT_PRIVILEGE_REQUIRED: i32 = 201;

#[derive(Debug, StructOpt)]
#[structopt(name = "muster", about = "Managed-software lifecycle engine")]
struct Opt {
    /// Check for available updates, but do not install anything.
    #[structopt(long)]
    checkonly: bool,

    /// Apply the existing plan without checking the repository first.
    #[structopt(long)]
    installonly: bool,

    /// Unattended background run: check, then apply only unattended items.
    #[structopt(long)]
    auto: bool,

    /// Override the client identifier used to select the primary manifest.
    #[structopt(long)]
    id: Option<String>,

    /// Use a local manifest file as the primary manifest.
    #[structopt(long, parse(from_os_str))]
    manifest: Option<PathBuf>,

    /// More verbose output on stderr (repeatable).
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Internal: background worker that downloads precache-flagged optional
    /// installs.
    #[structopt(name = "precache-agent", setting = structopt::clap::AppSettings::Hidden)]
    PrecacheAgent,
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // Safety: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    true
}

fn main() {
    let opt = Opt::from_args();
    let prefs = Preferences::open(&PrefPaths::standard());

    if let Some(Command::PrecacheAgent) = opt.command {
        env_logger::init();
        exit(precache::run_agent(&prefs));
    }

    if opt.checkonly && opt.installonly {
        eprintln!("--checkonly and --installonly are mutually exclusive");
        exit(EXIT_INVALID_PARAMETERS);
    }

    if !running_as_root() && !opt.checkonly {
        eprintln!("You must run this as root!");
        exit(EXIT_PRIVILEGE_REQUIRED);
    }

    if let Err(e) = muster_client::logging::setup(&prefs, opt.verbose > 0) {
        eprintln!("Could not set up logging: {}", e);
    }

    let mut ctx = match Context::initialize(prefs) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("{}", e);
            exit(EXIT_MANAGED_DIR_FAILURE);
        }
    };

    // One engine run at a time.
    let lock_path = ctx.dirs.root().join("run_lock");
    let lock_file = match File::create(&lock_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("Could not create run lock: {}", e);
            exit(EXIT_UPDATES_PLANNED);
        }
    };
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = match lock.try_write() {
        Ok(g) => g,
        Err(_) => {
            log::warn!("Another run is already in progress");
            exit(EXIT_UPDATES_PLANNED);
        }
    };

    let exit_code = run(&mut ctx, &opt);
    ctx.finish();
    exit(exit_code);
}

fn run(ctx: &mut Context, opt: &Opt) -> i32 {
    let console_user = SystemConsoleUser.console_user();
    let scripts = ScriptHost::new(console_user.clone());
    let mut plan_exit = EXIT_NO_UPDATES;

    if !opt.installonly {
        let fetcher = match Fetcher::new(&ctx.prefs) {
            Ok(f) => f,
            Err(e) => {
                ctx.report.error(format!("Could not initialize the fetcher: {}", e));
                return EXIT_UPDATES_PLANNED;
            }
        };
        let ledger = match UsageLedger::open(&ctx.dirs.usage_db_path()) {
            Ok(l) => Some(l),
            Err(e) => {
                ctx.report.warn(format!("Application usage data unavailable: {}", e));
                None
            }
        };

        let mut planner = Planner::new(&ctx.prefs, &ctx.dirs, &ctx.facts);
        planner.fetcher = Some(&fetcher);
        planner.apps = scan_applications(Path::new("/"));
        planner.scripts = Some(&scripts);
        planner.usage = ledger.as_ref();

        let outcome = {
            let mut report = std::mem::take(&mut ctx.report);
            let result = planner.plan(&mut report, opt.id.as_deref(), opt.manifest.as_deref());
            ctx.report = report;
            result
        };

        let outcome = match outcome {
            Ok(o) => o,
            Err(PlanError::StopRequested) => {
                log::info!("Run stopped by request");
                muster_client::stop::clear_stop_request();
                return EXIT_NO_UPDATES;
            }
            Err(e @ PlanError::PrimaryManifestUnavailable(_)) => {
                ctx.report.error(format!("{}", e));
                return EXIT_REPO_UNREACHABLE;
            }
            Err(e @ PlanError::PrimaryManifestInvalid(_)) => {
                ctx.report.error(format!("{}", e));
                return EXIT_REPO_UNREACHABLE;
            }
        };

        plan_exit = outcome.exit_code;
        if precache::has_precachable_items(&outcome.installinfo) {
            if let Err(e) = precache::spawn_agent() {
                log::warn!("Could not launch the precache agent: {}", e);
            }
        }

        if opt.checkonly {
            return plan_exit;
        }
        if plan_exit == EXIT_NO_UPDATES {
            log::info!("No changes to managed software.");
            return EXIT_NO_UPDATES;
        }
    }

    let mut executor = Executor::new(&ctx.prefs, &ctx.dirs, &scripts);
    executor.console_user = console_user;
    let post_action = {
        let mut report = std::mem::take(&mut ctx.report);
        let result = executor.run(&mut report, opt.auto);
        ctx.report = report;
        result
    };

    match post_action {
        Ok(PostAction::None) => {}
        Ok(PostAction::Logout) => log::info!("A logout is required to finish the session."),
        Ok(PostAction::Restart) => log::info!("A restart is required to finish the session."),
        Ok(PostAction::Shutdown) => log::info!("A shutdown is required to finish the session."),
        Err(e) => {
            if opt.installonly {
                ctx.report.error(format!("{}", e));
                return EXIT_UPDATES_PLANNED;
            }
        }
    }

    // Residual work (skips, failures) is reflected in the rewritten plan.
    match plist::from_file::<_, muster_types::InstallInfo>(ctx.dirs.installinfo_path()) {
        Ok(residual) if residual.needs_action() => EXIT_UPDATES_PLANNED,
        _ => EXIT_NO_UPDATES,
    }
}
