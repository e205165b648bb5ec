use std::error::Error;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atty::Stream;
use clap::{Parser, Subcommand};
use realvoice_rs::archive;
use realvoice_rs::client::SurveyClient;
use realvoice_rs::pattern::Pattern;
use realvoice_rs::pipeline::{DEBOUNCE_DELAY, DisplayedSentiment};
use realvoice_rs::submission::{
    ClassifyPolicy, ClientMetadata, GRADE_LEVELS, NameOption, SubmitOutcome, grade_level,
};
use realvoice_rs::{OpinionPipeline, SentimentResult, SurveyForm};
use serde_json::json;
use termimad::{FmtText, MadSkin, terminal_size};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";
const METER_CELLS: usize = 30;

#[derive(Parser, Debug)]
#[command(name = "realvoice-rs", about = "Sentiment-gated student opinion survey", version)]
pub struct Cli {
    /// Emit JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the survey HTTP server.
    #[cfg(feature = "web")]
    Serve(ServeArgs),
    /// Classify an opinion through a running server.
    Classify {
        /// Server base URL.
        #[arg(long, env = "REALVOICE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
        /// Opinion text; multiple words are joined with spaces.
        #[arg(required = true)]
        opinion: Vec<String>,
    },
    /// Print the decorative background for an opinion.
    Pattern {
        opinion: String,
        /// Print a CSS `background-image` value instead of raw SVG.
        #[arg(long)]
        css: bool,
        /// Also rasterize the pattern to this PNG file.
        #[arg(long)]
        png: Option<PathBuf>,
    },
    /// Fill in the survey interactively, with live sentiment while typing.
    Compose {
        #[arg(long, env = "REALVOICE_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
        /// Quiet period before a typed opinion is classified.
        #[arg(long, default_value_t = DEBOUNCE_DELAY.as_millis() as u64)]
        debounce_ms: u64,
        /// Submit with the sentiment already on screen when it matches the text.
        #[arg(long)]
        reuse_displayed: bool,
    },
}

#[cfg(feature = "web")]
#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, env = "REALVOICE_ADDR", default_value = "127.0.0.1:3000")]
    addr: std::net::SocketAddr,
    /// Public URL of this server; defaults to http://<addr>.
    #[arg(long, env = "REALVOICE_BASE_URL")]
    base_url: Option<String>,
    /// Text-classification inference endpoint.
    #[arg(long, env = "REALVOICE_CLASSIFIER_URL", default_value = realvoice_rs::classifier::DEFAULT_MODEL_URL)]
    classifier_url: String,
    /// Bearer token for the inference endpoint.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    classifier_token: Option<String>,
    #[arg(long, env = "REALVOICE_CACHE_CAPACITY", default_value_t = realvoice_rs::classifier::DEFAULT_CACHE_CAPACITY)]
    cache_capacity: usize,
    /// Directory for submissions.jsonl and images/; submissions stay in memory when unset.
    #[arg(long, env = "REALVOICE_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Render a PNG pattern for every accepted submission.
    #[arg(long)]
    render_images: bool,
    /// Resolve caller IPs to "City, Country".
    #[arg(long)]
    geolocate: bool,
    #[arg(long)]
    no_openapi: bool,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        #[cfg(feature = "web")]
        Command::Serve(args) => handle_serve(args),
        Command::Classify { server, opinion } => handle_classify(&server, opinion.join(" "), cli.json),
        Command::Pattern { opinion, css, png } => handle_pattern(&opinion, css, png, cli.json),
        Command::Compose {
            server,
            debounce_ms,
            reuse_displayed,
        } => {
            let policy = if reuse_displayed {
                ClassifyPolicy::ReuseDisplayed
            } else {
                ClassifyPolicy::Fresh
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(compose(
                SurveyClient::new(server),
                Duration::from_millis(debounce_ms),
                policy,
                cli.json,
            ))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("realvoice_rs=info,tower_http=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(feature = "web")]
fn handle_serve(args: ServeArgs) -> Result<(), Box<dyn Error>> {
    use realvoice_rs::web::{WebConfig, serve};

    let config = WebConfig {
        addr: args.addr,
        enable_openapi: !args.no_openapi,
        base_url: args
            .base_url
            .unwrap_or_else(|| format!("http://{}", args.addr)),
        classifier_url: args.classifier_url,
        classifier_token: args.classifier_token,
        cache_capacity: args.cache_capacity,
        data_dir: args.data_dir,
        render_images: args.render_images,
        geolocation: args.geolocate,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(config))?;
    Ok(())
}

fn handle_classify(server: &str, opinion: String, as_json: bool) -> Result<(), Box<dyn Error>> {
    if opinion.trim().is_empty() {
        return Err("Opinion cannot be empty".into());
    }
    let result = SurveyClient::new(server).analyze(&opinion)?;
    if as_json {
        let payload = json!({
            "opinion": opinion,
            "label": result.label,
            "score": result.score,
            "width": result.progress_width(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", meter_line(&result));
    }
    Ok(())
}

fn handle_pattern(
    opinion: &str,
    css: bool,
    png: Option<PathBuf>,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let pattern = Pattern::generate(opinion);
    if let Some(path) = &png {
        archive::render(&pattern, archive::DEFAULT_WIDTH, archive::DEFAULT_HEIGHT).save(path)?;
    }
    if as_json {
        let payload = json!({
            "opinion": opinion,
            "hue_start": pattern.hue_start,
            "hue_end": pattern.hue_end,
            "angle": pattern.angle,
            "particles": pattern.particles.len(),
            "png": png,
            "css": css.then(|| pattern.css_background()),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if css {
        println!("{}", pattern.css_background());
    } else {
        println!("{}", pattern.to_svg());
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
enum ComposeInput {
    Grade(&'static str),
    Name(String),
    Anonymous,
    Submit,
    Another,
    Help,
    Quit,
    Opinion(String),
}

fn parse_input(line: &str) -> Result<ComposeInput, String> {
    let Some(command) = line.strip_prefix(':') else {
        return Ok(ComposeInput::Opinion(line.to_string()));
    };
    let (verb, rest) = command
        .split_once(char::is_whitespace)
        .map(|(verb, rest)| (verb, rest.trim()))
        .unwrap_or((command.trim(), ""));
    match verb {
        "grade" => grade_level(rest)
            .map(ComposeInput::Grade)
            .ok_or_else(|| format!("Grade must be one of: {}", GRADE_LEVELS.join(", "))),
        "name" if rest.is_empty() => Err("Usage: :name <your name>".to_string()),
        "name" => Ok(ComposeInput::Name(rest.to_string())),
        "anon" => Ok(ComposeInput::Anonymous),
        "submit" => Ok(ComposeInput::Submit),
        "another" => Ok(ComposeInput::Another),
        "help" => Ok(ComposeInput::Help),
        "quit" | "q" => Ok(ComposeInput::Quit),
        other => Err(format!("Unknown command :{other} (try :help)")),
    }
}

const COMPOSE_HELP: &str = "\
**Compose an opinion**

Type a line to set your opinion; sentiment appears once you pause.

* `:grade <Freshman|Sophomore|Junior|Senior>`
* `:name <name>` to sign, `:anon` to stay anonymous
* `:submit` to send, `:another` to start over after submitting
* `:quit`
";

struct ComposeSession {
    client: Arc<SurveyClient>,
    pipeline: OpinionPipeline,
    form: SurveyForm,
    as_json: bool,
}

async fn compose(
    client: SurveyClient,
    delay: Duration,
    policy: ClassifyPolicy,
    as_json: bool,
) -> Result<(), Box<dyn Error>> {
    let client = Arc::new(client);
    let pipeline = OpinionPipeline::with_delay(Arc::clone(&client), delay);
    let screen = stdout_is_tty().then(terminal_size);
    let mut session = ComposeSession {
        client,
        pipeline,
        form: SurveyForm::new(ClientMetadata::snapshot(screen)).with_policy(policy),
        as_json,
    };

    let (lines_tx, mut lines) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    if !as_json {
        render_markdown(COMPOSE_HELP);
    }
    let mut displayed = session.pipeline.subscribe();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !session.handle_line(&line).await? {
                    break;
                }
            }
            changed = displayed.changed() => {
                if changed.is_err() {
                    break;
                }
                let shown = displayed.borrow_and_update().clone();
                session.print_sentiment(shown.as_ref())?;
            }
        }
    }
    session.pipeline.shutdown().await;
    Ok(())
}

impl ComposeSession {
    /// Returns false once the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> Result<bool, Box<dyn Error>> {
        let input = match parse_input(line) {
            Ok(input) => input,
            Err(message) => {
                self.notice("error", &message)?;
                return Ok(true);
            }
        };
        if self.form.is_submitted() && !matches!(input, ComposeInput::Another | ComposeInput::Quit | ComposeInput::Help) {
            self.notice("info", "Already submitted. Use :another to share another opinion.")?;
            return Ok(true);
        }
        match input {
            ComposeInput::Opinion(text) => {
                self.form.opinion = text.clone();
                self.pipeline.set_opinion(text);
            }
            ComposeInput::Grade(grade) => self.form.grade_level = grade.to_string(),
            ComposeInput::Name(name) => {
                self.form.name_option = NameOption::Provide;
                self.form.name = name;
            }
            ComposeInput::Anonymous => {
                self.form.name_option = NameOption::Anonymous;
                self.form.name.clear();
            }
            ComposeInput::Submit => self.submit().await?,
            ComposeInput::Another => {
                self.form.submit_another();
                self.pipeline.set_opinion(String::new());
                self.notice("info", "Form cleared.")?;
            }
            ComposeInput::Help => render_markdown(COMPOSE_HELP),
            ComposeInput::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn submit(&mut self) -> Result<(), Box<dyn Error>> {
        if self.form.grade_level.is_empty() {
            return self.notice("error", "Pick a grade level first with :grade.");
        }
        let shown = self.pipeline.subscribe().borrow().clone();
        self.form.remember_displayed(shown.as_ref());
        let client = Arc::clone(&self.client);
        match self.form.submit(client.as_ref(), client.as_ref()).await {
            SubmitOutcome::Accepted { message } => {
                self.notice("submitted", &message)?;
                if !self.as_json {
                    println!("Thank you for sharing your opinion! Use :another to submit again.");
                }
                Ok(())
            }
            SubmitOutcome::Rejected(result) => {
                let message = self.form.error().unwrap_or_default().to_string();
                if self.as_json {
                    let payload = json!({ "event": "rejected", "message": message, "sentiment": result });
                    println!("{}", serde_json::to_string(&payload)?);
                    Ok(())
                } else {
                    println!("{}", meter_line(&result));
                    self.notice("rejected", &message)
                }
            }
            SubmitOutcome::Invalid(message) => self.notice("error", &message),
            SubmitOutcome::Failed => {
                let message = self.form.error().unwrap_or_default().to_string();
                self.notice("error", &message)
            }
        }
    }

    fn print_sentiment(&self, shown: Option<&DisplayedSentiment>) -> Result<(), Box<dyn Error>> {
        if self.as_json {
            let payload = match shown {
                Some(shown) => json!({
                    "event": "sentiment",
                    "label": shown.result.label,
                    "score": shown.result.score,
                    "width": shown.result.progress_width(),
                }),
                None => json!({ "event": "sentiment", "label": null }),
            };
            println!("{}", serde_json::to_string(&payload)?);
        } else if let Some(shown) = shown {
            println!("{}", meter_line(&shown.result));
        }
        Ok(())
    }

    fn notice(&self, event: &str, message: &str) -> Result<(), Box<dyn Error>> {
        if self.as_json {
            let payload = json!({ "event": event, "message": message });
            println!("{}", serde_json::to_string(&payload)?);
        } else if event == "error" || event == "rejected" {
            eprintln!("{message}");
        } else {
            println!("{message}");
        }
        Ok(())
    }
}

fn meter_line(result: &SentimentResult) -> String {
    let filled = ((result.progress_percent() / 100.0) * METER_CELLS as f32).round() as usize;
    let filled = filled.min(METER_CELLS);
    format!(
        "[{}{}] {} {} ({:.2})",
        "#".repeat(filled),
        ".".repeat(METER_CELLS - filled),
        result.progress_width(),
        result.label_title(),
        result.score
    )
}

fn stdout_is_tty() -> bool {
    atty::is(Stream::Stdout)
}

fn markdown_width() -> usize {
    let (width, _) = terminal_size();
    width.max(60) as usize
}

fn render_markdown(body: &str) {
    let trimmed = body.trim();
    if stdout_is_tty() {
        let skin = MadSkin::default();
        let formatted = FmtText::from(&skin, trimmed, Some(markdown_width()));
        println!("{formatted}");
    } else {
        println!("{trimmed}");
    }
}
