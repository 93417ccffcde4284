//! confcom CLI entry point.
//!
//! Subcommands generate policies from ARM templates, author and sign
//! fragments, and move fragments through OCI registries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use base64::Engine;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use confcom::authoring::{self, FragmentRequest, Publish, SigningMaterial};
use confcom::config::ConfcomConfig;
use confcom::executor::ProcessRunner;
use confcom::import::{ImportResolver, ImportsFile};
use confcom::policy::inject::{self, Injection, OverwriteApprover};
use confcom::policy::{self, rego, BuildOptions, PolicySpec, WildcardApprover};
use confcom::registry::{FragmentRegistry, OrasClient};
use confcom::template::{self, ParameterValues, Template};
use confcom::trust::{self, Algorithm, FragmentSigner, Sign1Util, SignRequest};

/// confcom: confidential-container security policies and fragments.
#[derive(Parser)]
#[command(name = "confcom", version, about)]
struct Cli {
    /// Also write JSON logs to this directory (daily rotation).
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Generate security policies from an ARM template or spec file.
    Policy(PolicyArgs),
    /// Author policy fragments.
    Fragment {
        /// Fragment subcommand.
        #[command(subcommand)]
        command: FragmentCommand,
    },
    /// Sign a Rego payload into a COSE Sign1 envelope.
    Sign(SignArgs),
    /// Verify a signed fragment and print its claims.
    Verify {
        /// Signed fragment envelope.
        signed: PathBuf,
    },
    /// Add fragment import statements to an imports file.
    Import(ImportArgs),
    /// List fragment digests attached to an image.
    Discover {
        /// Image reference.
        image: String,
    },
    /// Push a signed fragment as a standalone artifact.
    Push {
        /// Signed fragment envelope.
        signed: PathBuf,
        /// Destination reference.
        destination: String,
    },
    /// Attach a signed fragment to an image as a referrer.
    Attach {
        /// Signed fragment envelope.
        signed: PathBuf,
        /// Image reference.
        image: String,
    },
}

/// Fragment authoring subcommands.
#[derive(Subcommand)]
enum FragmentCommand {
    /// Render a spec file as a fragment, optionally signing and publishing it.
    Generate(GenerateArgs),
}

/// Output encodings for generated policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Compiled policy model as JSON.
    Json,
    /// Rego policy document.
    Rego,
    /// Base64 of the Rego policy document.
    Base64,
}

/// Shared compile switches.
#[derive(Args)]
struct BuildFlags {
    /// Allow debug shells and runtime logging.
    #[arg(long)]
    debug_mode: bool,
    /// Deny stdio attachment to containers.
    #[arg(long)]
    disable_stdio: bool,
    /// Emit wildcard rules for unresolved env values without asking.
    #[arg(long, short = 'y')]
    approve_wildcards: bool,
}

#[derive(Args)]
struct PolicyArgs {
    /// ARM template file.
    #[arg(long, short = 'a', conflicts_with = "input")]
    template: Option<PathBuf>,
    /// ARM parameters file.
    #[arg(long, short = 'p', requires = "template")]
    parameters: Option<PathBuf>,
    /// Standalone policy spec file.
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,
    /// Imports file whose fragments every group trusts.
    #[arg(long)]
    fragments_json: Option<PathBuf>,
    /// Minimum SVN for the default infrastructure fragment.
    #[arg(long, conflicts_with = "input")]
    infrastructure_svn: Option<String>,
    /// Leave the default infrastructure fragment out.
    #[arg(long, conflicts_with = "input")]
    exclude_default_fragments: bool,
    /// Output encoding.
    #[arg(long, value_enum, default_value = "rego")]
    output: OutputFormat,
    /// Write output here instead of stdout.
    #[arg(long)]
    out_file: Option<PathBuf>,
    /// Write each policy into its container group in the template file.
    #[arg(long, requires = "template", conflicts_with_all = ["out_file", "output"])]
    inject: bool,
    #[command(flatten)]
    flags: BuildFlags,
}

#[derive(Args)]
struct GenerateArgs {
    /// Standalone policy spec file.
    #[arg(long, short = 'i')]
    input: PathBuf,
    /// Rego package name of the fragment.
    #[arg(long)]
    namespace: String,
    /// SVN of the fragment.
    #[arg(long)]
    svn: String,
    /// Feed claim; defaults to the first container image without its tag.
    #[arg(long)]
    feed: Option<String>,
    /// Directory for the rendered and signed files.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// PEM private key; signs the fragment when given with --chain.
    #[arg(long, requires = "chain")]
    key: Option<PathBuf>,
    /// PEM certificate chain.
    #[arg(long, requires = "key")]
    chain: Option<PathBuf>,
    /// Signing algorithm (defaults to the configured one).
    #[arg(long)]
    algorithm: Option<String>,
    /// Attach the signed fragment to this image.
    #[arg(long, conflicts_with = "push_to")]
    attach_to: Option<String>,
    /// Push the signed fragment to this reference.
    #[arg(long)]
    push_to: Option<String>,
    #[command(flatten)]
    flags: BuildFlags,
}

#[derive(Args)]
struct SignArgs {
    /// Rego payload.
    #[arg(long)]
    payload: PathBuf,
    /// PEM private key.
    #[arg(long)]
    key: PathBuf,
    /// PEM certificate chain.
    #[arg(long)]
    chain: PathBuf,
    /// Feed claim.
    #[arg(long)]
    feed: Option<String>,
    /// Issuer claim; derived from the chain when omitted.
    #[arg(long)]
    issuer: Option<String>,
    /// Signing algorithm (defaults to the configured one).
    #[arg(long)]
    algorithm: Option<String>,
    /// Output envelope; defaults to `<payload>.cose`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct ImportArgs {
    /// Image whose attached fragments to import.
    #[arg(long, conflicts_with = "path", required_unless_present = "path")]
    image: Option<String>,
    /// Local signed fragment to import.
    #[arg(long)]
    path: Option<PathBuf>,
    /// Lowest fragment SVN to accept.
    #[arg(long)]
    minimum_svn: String,
    /// Imports file to update.
    #[arg(long)]
    fragments_json: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _logging_guard = match &cli.log_dir {
        Some(dir) => Some(confcom::logging::init_with_file(dir)?),
        None => {
            confcom::logging::init_cli();
            None
        }
    };

    let config = ConfcomConfig::load().context("failed to load configuration")?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Command::Policy(args) => handle_policy(args),
        Command::Fragment {
            command: FragmentCommand::Generate(args),
        } => handle_generate(args, &config).await,
        Command::Sign(args) => handle_sign(args, &config).await,
        Command::Verify { signed } => handle_verify(&signed, &config).await,
        Command::Import(args) => handle_import(args, &config).await,
        Command::Discover { image } => handle_discover(&image, &config).await,
        Command::Push {
            signed,
            destination,
        } => {
            let registry = registry_client(&config);
            registry.check_available().await?;
            registry.push(&signed, &destination).await?;
            Ok(())
        }
        Command::Attach { signed, image } => {
            let registry = registry_client(&config);
            registry.check_available().await?;
            registry.attach(&image, &signed).await?;
            Ok(())
        }
    }
}

fn signer(config: &ConfcomConfig) -> Sign1Util<ProcessRunner> {
    Sign1Util::new(
        ProcessRunner::new(),
        config.tools.sign1util.clone(),
        config.signing_timeout(),
    )
}

fn registry_client(config: &ConfcomConfig) -> OrasClient<ProcessRunner> {
    OrasClient::new(
        ProcessRunner::new(),
        config.tools.oras.clone(),
        config.registry_timeout(),
    )
    .with_artifact_type(config.registry.artifact_type.clone())
}

fn algorithm(flag: Option<&str>, config: &ConfcomConfig) -> anyhow::Result<Algorithm> {
    match flag {
        Some(name) => Ok(name.parse()?),
        None => config.algorithm(),
    }
}

/// Asks on the terminal before emitting a wildcard env rule or replacing
/// an existing template policy.
struct PromptApprover;

impl WildcardApprover for PromptApprover {
    fn approve(&self, container: &str, variable: &str) -> bool {
        confirm(&format!(
            "Environment variable {variable} in container {container} has no value. \
             Allow any value?"
        ))
    }
}

impl OverwriteApprover for PromptApprover {
    fn approve_overwrite(&self, group: &str) -> bool {
        confirm(&format!(
            "Container group {group} already has a policy in the ARM template. Overwrite it?"
        ))
    }
}

/// Yes/no question on stderr; `false` when stdin is not a terminal.
fn confirm(question: &str) -> bool {
    if !std::io::stdin().is_terminal() {
        return false;
    }
    eprint!("{question} [y/N] ");
    if std::io::stderr().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn build_options(flags: &BuildFlags) -> BuildOptions {
    BuildOptions {
        debug_mode: flags.debug_mode,
        allow_stdio_access: !flags.disable_stdio,
        approve_wildcards: flags.approve_wildcards,
        infrastructure_svn: None,
        exclude_default_fragments: false,
    }
}

fn handle_policy(args: PolicyArgs) -> anyhow::Result<()> {
    let options = BuildOptions {
        infrastructure_svn: args.infrastructure_svn.clone(),
        exclude_default_fragments: args.exclude_default_fragments,
        ..build_options(&args.flags)
    };
    let pulled = match &args.fragments_json {
        Some(path) => ImportsFile::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?
            .fragments()
            .to_vec(),
        None => Vec::new(),
    };

    let policies: Vec<PolicySpec> = match (&args.template, &args.input) {
        (Some(template_path), None) => {
            let template = Template::load(template_path)?;
            let supplied = match &args.parameters {
                Some(path) => ParameterValues::load(path)?,
                None => ParameterValues::new(),
            };
            let evaluated = template::evaluate(&template, &supplied)?;
            policy::build(&evaluated, &pulled, &options, &PromptApprover)?
        }
        (None, Some(input)) => {
            let document = policy::spec_file::load_spec_file(input)?;
            let mut spec = policy::build_from_spec_file(&document, &options, &PromptApprover)?;
            let mut fragments = pulled;
            fragments.append(&mut spec.fragments);
            spec.fragments = policy::dedup_fragments(fragments);
            vec![spec]
        }
        _ => bail!("exactly one of --template or --input is required"),
    };

    if args.inject {
        let template_path = args
            .template
            .as_deref()
            .context("--inject requires --template")?;
        return inject_into_template(template_path, &policies, options.debug_mode);
    }

    let rendered = policies
        .iter()
        .map(|spec| render(spec, args.output, options.debug_mode))
        .collect::<anyhow::Result<Vec<_>>>()?;
    emit(&rendered.join("\n"), args.out_file.as_deref())?;
    info!(policies = policies.len(), "generated security policies");
    Ok(())
}

fn inject_into_template(
    template_path: &Path,
    policies: &[PolicySpec],
    debug_mode: bool,
) -> anyhow::Result<()> {
    let rego_texts = policies
        .iter()
        .map(|spec| rego::render_policy(spec, debug_mode))
        .collect::<Result<Vec<_>, _>>()?;
    let encoded: Vec<String> = rego_texts
        .iter()
        .map(|text| base64::engine::general_purpose::STANDARD.encode(text))
        .collect();

    let mut document = Template::load(template_path)?.document().clone();
    let outcomes = inject::inject_policies(&mut document, &encoded, &PromptApprover)?;
    let text = serde_json::to_string_pretty(&document)?;
    std::fs::write(template_path, format!("{text}\n"))
        .with_context(|| format!("failed to write {}", template_path.display()))?;

    for (outcome, rego_text) in outcomes.iter().zip(&rego_texts) {
        if let Injection::Written { group } = outcome {
            println!("{group} {}", inject::policy_hash(rego_text));
        }
    }
    info!(
        template = %template_path.display(),
        groups = outcomes.len(),
        "injected security policies"
    );
    Ok(())
}

fn render(spec: &PolicySpec, format: OutputFormat, debug_mode: bool) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(spec)?,
        OutputFormat::Rego => rego::render_policy(spec, debug_mode)?,
        OutputFormat::Base64 => base64::engine::general_purpose::STANDARD
            .encode(rego::render_policy(spec, debug_mode)?),
    })
}

fn emit(text: &str, out_file: Option<&Path>) -> anyhow::Result<()> {
    match out_file {
        Some(path) => std::fs::write(path, format!("{text}\n"))
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

async fn handle_generate(args: GenerateArgs, config: &ConfcomConfig) -> anyhow::Result<()> {
    let document = policy::spec_file::load_spec_file(&args.input)?;
    let spec = policy::build_from_spec_file(&document, &build_options(&args.flags), &PromptApprover)?;

    let signing = match (args.key, args.chain) {
        (Some(key), Some(chain)) => Some(SigningMaterial {
            key,
            chain,
            algorithm: algorithm(args.algorithm.as_deref(), config)?,
        }),
        _ => None,
    };
    let publish = match (args.attach_to, args.push_to) {
        (Some(image), _) => Some(Publish::AttachTo(image)),
        (None, Some(destination)) => Some(Publish::PushTo(destination)),
        (None, None) => None,
    };

    let signer = signer(config);
    let registry = registry_client(config);
    if signing.is_some() {
        signer.check_available().await?;
    }
    if publish.is_some() {
        registry.check_available().await?;
    }

    let request = FragmentRequest {
        namespace: args.namespace,
        svn: args.svn,
        feed: args.feed,
        output_dir: args.output_dir,
        signing,
        publish,
    };
    let outcome = authoring::generate_fragment(&spec, &request, &signer, &registry).await?;

    println!("{}", outcome.rego_path.display());
    if let Some(signed) = &outcome.signed_path {
        println!("{}", signed.display());
    }
    Ok(())
}

async fn handle_sign(args: SignArgs, config: &ConfcomConfig) -> anyhow::Result<()> {
    let signer = signer(config);
    signer.check_available().await?;

    let issuer = match args.issuer {
        Some(issuer) => issuer,
        None => signer.create_issuer(&args.chain).await?,
    };
    let mut request = SignRequest::new(&args.payload, &args.key, &args.chain)
        .with_issuer(issuer)
        .with_algorithm(algorithm(args.algorithm.as_deref(), config)?);
    if let Some(feed) = args.feed {
        request = request.with_feed(feed);
    }
    if let Some(out) = args.out {
        request = request.with_out(out);
    }

    let out = signer.sign(&request).await?;
    println!("{}", out.display());
    Ok(())
}

async fn handle_verify(signed: &Path, config: &ConfcomConfig) -> anyhow::Result<()> {
    let signer = signer(config);
    signer.check_available().await?;
    let fragment = trust::verify_and_extract(&signer, signed).await?;

    println!("issuer: {}", fragment.issuer);
    println!("feed: {}", fragment.feed);
    if let Some(namespace) = rego::extract_namespace(&fragment.payload) {
        println!("namespace: {namespace}");
    }
    if let Some(svn) = rego::extract_svn(&fragment.payload) {
        println!("svn: {svn}");
    }
    Ok(())
}

async fn handle_import(args: ImportArgs, config: &ConfcomConfig) -> anyhow::Result<()> {
    let signer = signer(config);
    let registry = registry_client(config);
    signer.check_available().await?;

    let resolver = ImportResolver::new(&registry, &signer, config.paths.scratch_dir.clone());
    let imports = match (&args.image, &args.path) {
        (Some(image), None) => {
            registry.check_available().await?;
            resolver.resolve_all(image, &args.minimum_svn).await?
        }
        (None, Some(path)) => vec![resolver.resolve_path(path, &args.minimum_svn).await?],
        _ => bail!("exactly one of --image or --path is required"),
    };

    let mut file = ImportsFile::load(&args.fragments_json)
        .with_context(|| format!("failed to load {}", args.fragments_json.display()))?;
    let added = imports.len();
    file.append(imports);
    file.write(&args.fragments_json)?;
    info!(
        path = %args.fragments_json.display(),
        added,
        total = file.fragments().len(),
        "updated imports file"
    );
    Ok(())
}

async fn handle_discover(image: &str, config: &ConfcomConfig) -> anyhow::Result<()> {
    let registry = registry_client(config);
    registry.check_available().await?;
    for digest in registry.discover(image).await? {
        println!("{digest}");
    }
    Ok(())
}
