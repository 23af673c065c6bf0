use anyhow::{Context as _, Error};
use clap::{Parser, Subcommand};
use indicatif as ia;
use tracing_subscriber::filter::LevelFilter;
use winsplat::PathBuf;

#[cfg(all(target_env = "musl", target_arch = "x86_64"))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn setup_logger(json: bool, log_level: LevelFilter) -> Result<(), Error> {
    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();

    // If a user specifies a log level, we assume it only pertains to winsplat,
    // if they want to trace other crates they can use the RUST_LOG env approach
    env_filter = env_filter.add_directive(format!("winsplat={log_level}").parse()?);

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if json {
        tracing::subscriber::set_global_default(subscriber.json().finish())
            .context("failed to set default subscriber")?;
    } else {
        tracing::subscriber::set_global_default(subscriber.finish())
            .context("failed to set default subscriber")?;
    }

    Ok(())
}

#[derive(Subcommand)]
pub enum Command {
    /// Displays a summary of the packages the catalog resolves to for the
    /// requested target, without downloading anything
    List,
    /// Fetches all the resolved payloads that aren't already present in the
    /// download cache, verifying every digest
    Fetch,
    /// Additionally decodes every fetched payload, proving the archives
    /// sound without writing an output tree
    Extract,
    /// Runs the full pipeline and splats the CRT and Windows SDK into a
    /// case correct output tree
    Splat {
        /// The MSVCRT includes (non-redistributable) debug versions of the
        /// various libs that are generally uninteresting to keep for most usage
        #[clap(long)]
        include_debug_libs: bool,
        /// The MSVCRT includes PDB (debug symbols) files for several of the
        /// libraries that are generally uninteresting to keep for most usage
        #[clap(long)]
        include_debug_symbols: bool,
        /// By default, symlinks are added to both the CRT and WindowsSDK to
        /// address casing issues in general usage. For example, if you are
        /// compiling C/C++ code that does `#include <windows.h>`, it will break
        /// on a case-sensitive file system, as the actual path in the WindowsSDK
        /// is `Windows.h`. This also applies even if the C/C++ you are compiling
        /// uses correct casing for all CRT/SDK includes, as the internal headers
        /// also use incorrect casing in most cases.
        #[clap(long)]
        disable_symlinks: bool,
        /// By default, we convert the MS specific `x64`, `arm`, and `arm64`
        /// target architectures to the more canonical `x86_64`, `aarch`, and
        /// `aarch64` of LLVM etc when creating directories/names. Passing this
        /// flag will preserve the MS names for those targets.
        #[clap(long)]
        preserve_ms_arch_notation: bool,
        /// The root output directory. Defaults to `./.winsplat-cache/splat` if
        /// not specified.
        #[clap(long)]
        output: Option<PathBuf>,
        /// A TOML rules file replacing the built in alias tables, for
        /// toolchains that expect additional or different link names
        #[clap(long)]
        map: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
pub struct CatalogSource {
    /// Reads the package catalog from a local JSON file
    #[clap(long)]
    catalog: Option<PathBuf>,
    /// Retrieves the package catalog from a URL
    #[clap(long)]
    catalog_url: Option<String>,
}

#[derive(Parser)]
pub struct Args {
    /// Doesn't display the prompt to accept the license
    #[clap(long, env = "WINSPLAT_ACCEPT_LICENSE")]
    accept_license: bool,
    /// The log level for messages, only log messages at or above the level
    /// will be emitted.
    ///
    /// Possible values: off, error, warn, info, debug, trace
    #[clap(short = 'L', long = "log-level", default_value = "info")]
    level: LevelFilter,
    /// Output log messages as json
    #[clap(long)]
    json: bool,
    /// Prints the run summary as json to stdout when the run succeeds,
    /// progress bars and logs move to stderr
    #[clap(long)]
    summary: bool,
    /// If set, will use a temporary directory for the download cache that is
    /// deleted upon exit, otherwise all verified payloads are kept in the
    /// `--cache-dir` and won't be retrieved again
    #[clap(long)]
    temp: bool,
    /// Specifies the cache directory used to persist verified payloads to
    /// disk. Defaults to `./.winsplat-cache` if not specified.
    #[clap(long)]
    cache_dir: Option<PathBuf>,
    #[clap(flatten)]
    source: CatalogSource,
    /// The number of concurrent workers, zero means one per logical cpu
    #[clap(long, default_value_t = 0)]
    concurrency: usize,
    /// Pins the CRT to an exact catalog version instead of the latest
    #[clap(long)]
    crt_version: Option<String>,
    /// Pins the SDK to an exact catalog version instead of the latest
    #[clap(long)]
    sdk_version: Option<String>,
    /// The architecture to target.
    ///
    /// Possible values: x86, x86_64, aarch, aarch64
    #[clap(long, default_value = "x86_64")]
    arch: winsplat::Arch,
    /// The CRT variant to target.
    ///
    /// Possible values: desktop, onecore, store, spectre
    #[clap(long, default_value = "desktop")]
    variant: winsplat::Variant,
    #[clap(subcommand)]
    cmd: Command,
}

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:.bold} [{elapsed}] {wide_bar:.green} {bytes}/{total_bytes} {msg}";

fn bar_style() -> ia::ProgressStyle {
    ia::ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap()
        .progress_chars("█▇▆▅▄▃▂▁  ")
}

struct CliProgress {
    mp: ia::MultiProgress,
    draw_target: winsplat::util::ProgressTarget,
}

impl winsplat::Progress for CliProgress {
    fn register(&self, payload: &winsplat::catalog::PayloadRecord) -> ia::ProgressBar {
        use winsplat::PayloadKind;

        let prefix = match payload.kind {
            PayloadKind::CrtHeaders => "CRT.headers".to_owned(),
            PayloadKind::CrtLibs => format!(
                "CRT.libs.{}.{}",
                payload.arch.map_or("all", |a| a.as_str()),
                payload.variant.map_or("none", |v| v.as_str()),
            ),
            PayloadKind::SdkHeaders => format!(
                "SDK.headers.{}",
                payload.arch.map_or("all", |a| a.as_str()),
            ),
            PayloadKind::SdkLibs => {
                format!("SDK.libs.{}", payload.arch.map_or("all", |a| a.as_str()))
            }
            PayloadKind::UcrtHeadersLibs => "SDK.ucrt.all".to_owned(),
        };

        self.mp.add(
            ia::ProgressBar::with_draw_target(Some(payload.size), self.draw_target.into())
                .with_prefix(prefix)
                .with_style(bar_style()),
        )
    }

    fn stage(&self, state: winsplat::State) {
        tracing::info!(stage = %state, "pipeline stage");
    }

    fn splat_progress(&self) -> ia::ProgressBar {
        self.mp.add(
            ia::ProgressBar::with_draw_target(None, self.draw_target.into())
                .with_prefix("Splat")
                .with_style(bar_style()),
        )
    }
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    setup_logger(args.json, args.level)?;

    if !args.accept_license {
        // The license link is the same for every locale, but we should probably
        // retrieve it from the catalog in the future
        println!("Do you accept the license at https://go.microsoft.com/fwlink/?LinkId=2086102 (yes | no)?");

        let mut accept = String::new();
        std::io::stdin().read_line(&mut accept)?;

        match accept.trim() {
            "yes" => println!("license accepted!"),
            "no" => anyhow::bail!("license not accepted"),
            other => anyhow::bail!("unknown response to license request {other}"),
        }
    }

    let cwd = PathBuf::from_path_buf(std::env::current_dir().context("unable to retrieve cwd")?)
        .map_err(|pb| anyhow::anyhow!("cwd {} is not a valid utf-8 path", pb.display()))?;

    let draw_target = if args.summary {
        // Keep stdout clean for the summary document
        winsplat::util::ProgressTarget::Stderr
    } else {
        winsplat::util::ProgressTarget::Stdout
    };

    let cache_dir = match &args.cache_dir {
        Some(cd) => cd.clone(),
        None => cwd.join(".winsplat-cache"),
    };

    let mut ctx = if args.temp {
        winsplat::Ctx::with_temp(draw_target)?
    } else {
        winsplat::Ctx::with_dir(cache_dir.clone(), draw_target)?
    };
    ctx.concurrency = args.concurrency;

    let catalog = if let Some(path) = &args.source.catalog {
        winsplat::manifest::load(path)?
    } else if let Some(url) = &args.source.catalog_url {
        winsplat::manifest::fetch(&ctx, url)?
    } else {
        anyhow::bail!("either --catalog or --catalog-url is required");
    };

    let request = winsplat::catalog::Request {
        arch: args.arch,
        variant: args.variant,
        crt_version: args.crt_version.clone(),
        sdk_version: args.sdk_version.clone(),
    };

    let ops = match args.cmd {
        Command::List => {
            let resolution = winsplat::catalog::resolve(&catalog.packages, &request)?;
            print_packages(&resolution);
            return Ok(());
        }
        Command::Fetch => winsplat::Ops::Fetch,
        Command::Extract => winsplat::Ops::Extract,
        Command::Splat {
            include_debug_libs,
            include_debug_symbols,
            disable_symlinks,
            preserve_ms_arch_notation,
            output,
            map,
        } => winsplat::Ops::Splat(winsplat::SplatConfig {
            include_debug_libs,
            include_debug_symbols,
            enable_symlinks: !disable_symlinks,
            preserve_ms_arch_notation,
            output: output.unwrap_or_else(|| cache_dir.join("splat")),
            map,
            link_strategy: None,
        }),
    };

    let mp = ia::MultiProgress::with_draw_target(draw_target.into());
    mp.set_move_cursor(true);

    let progress = CliProgress { mp, draw_target };
    let cancel = winsplat::Cancel::new();
    let config = winsplat::ExecConfig { request, ops };

    let summary = winsplat::execute(&ctx, &catalog.packages, &config, &cancel, &progress)?;

    if args.summary {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(())
}

fn print_packages(resolution: &winsplat::catalog::Resolution) {
    use cli_table::{format::Justify, Cell, Style, Table};

    let payloads: Vec<_> = resolution
        .packages()
        .flat_map(|pkg| pkg.payloads.iter())
        .collect();

    let total: u64 = payloads.iter().map(|pl| pl.size).sum();

    let totals = vec![
        "Total".cell().bold(true).justify(Justify::Right),
        "".cell(),
        "".cell(),
        "".cell(),
        ia::HumanBytes(total).cell().bold(true),
    ];

    let table = payloads
        .iter()
        .map(|pl| {
            vec![
                pl.file_name.clone().cell().justify(Justify::Right),
                pl.kind.to_string().cell(),
                pl.arch.map(|a| a.to_string()).unwrap_or_default().cell(),
                pl.variant.map(|v| v.to_string()).unwrap_or_default().cell(),
                ia::HumanBytes(pl.size).cell(),
            ]
        })
        .chain(std::iter::once(totals))
        .collect::<Vec<_>>()
        .table()
        .title(vec![
            "Name".cell(),
            "Kind".cell(),
            "Target".cell(),
            "Variant".cell(),
            "Download Size".cell(),
        ]);

    let _ = cli_table::print_stdout(table);
}
