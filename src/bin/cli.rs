// Proctor Relay CLI
// Checks a running relay, joins rooms by hand, replays the signaling
// scenarios and drives a headless candidate session.

use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use proctor_relay::client::{ApiClient, CandidateSession, SessionEnd, SessionInputs, SessionServices, SignalingClient};
use proctor_relay::integrity::{FaceClassification, FaceClassifier, IntegrityNotice, Visibility};
use proctor_relay::peer::{CaptureDevice, WebRtcLinkFactory};
use proctor_relay::protocol::ServerMessage;
use proctor_relay::session::{
    check_lockout, stored_session, ChannelNavigator, FileSessionStore, LockoutStatus, SessionIdentity, StoredSession,
    TerminalView,
};
use proctor_relay::Config;

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "proctor-cli")]
#[command(about = "Proctor relay CLI", long_about = None)]
struct Cli {
    /// Relay address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check server health endpoint
    Health,

    /// Get public client configuration
    Config,

    /// Join a room and print relay traffic until Ctrl+C
    Join {
        #[arg(short, long)]
        room_id: String,

        #[arg(short, long)]
        user_id: String,

        /// Join as the room's proctor
        #[arg(short, long)]
        admin: bool,
    },

    /// Run automated validation scenarios
    Validate {
        #[arg(short, long)]
        all: bool,

        #[arg(short, long)]
        scenario: Option<String>,
    },

    /// Show the lockout markers in a session store file
    Lockout {
        #[arg(short, long, default_value = "./session-store.json")]
        store: String,
    },

    /// Run a headless candidate session. Type `hide`/`show` to simulate tab
    /// switches and `face none|one|many` to change what the camera sees.
    Candidate {
        #[arg(short, long)]
        assessment_id: String,

        #[arg(short, long)]
        candidate_id: String,

        /// Collaborator API base URL (defaults to API_BASE_URL)
        #[arg(long)]
        api: Option<String>,

        /// Faces the simulated camera reports until changed from stdin
        #[arg(long, value_enum, default_value_t = FaceArg::One)]
        face: FaceArg,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FaceArg {
    None,
    One,
    Many,
}

impl From<FaceArg> for FaceClassification {
    fn from(face: FaceArg) -> Self {
        match face {
            FaceArg::None => FaceClassification::Zero,
            FaceArg::One => FaceClassification::One,
            FaceArg::Many => FaceClassification::Multiple,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => check_health(&cli.server).await,
        Commands::Config => check_config(&cli.server).await,
        Commands::Join {
            room_id,
            user_id,
            admin,
        } => join_room(&cli.server, room_id, user_id, *admin).await,
        Commands::Validate { all, scenario } => {
            if *all {
                run_all_validations(&cli.server).await;
            } else if let Some(s) = scenario {
                run_scenario(&cli.server, s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
        Commands::Lockout { store } => inspect_lockout(store).await,
        Commands::Candidate {
            assessment_id,
            candidate_id,
            api,
            face,
        } => run_candidate(&cli.server, assessment_id, candidate_id, api.as_deref(), *face).await,
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking server health...".cyan());

    let url = format!("http://{}/health", server);
    match reqwest::Client::new().get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            println!("  Make sure the relay is running on {}", server);
        }
    }
}

async fn check_config(server: &str) {
    println!("{}", "Fetching client configuration...".cyan());

    let url = format!("http://{}/config", server);
    match reqwest::Client::new().get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            println!("{} Config endpoint accessible", "✓".green());
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                println!("\nConfiguration:");
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            }
        }
        Ok(resp) => println!("{} Config fetch failed: {}", "✗".red(), resp.status()),
        Err(e) => println!("{} Cannot connect to server: {}", "✗".red(), e),
    }
}

async fn join_room(server: &str, room_id: &str, user_id: &str, admin: bool) {
    let role = if admin { "proctor" } else { "candidate" };
    println!("{} {} as {}", "Joining room".cyan(), room_id.bold(), role);

    let url = format!("ws://{}/signaling", server);
    let (client, mut inbound) =
        match SignalingClient::connect(&url, room_id, user_id, admin, Duration::from_secs(30)).await {
            Ok(joined) => joined,
            Err(e) => {
                println!("{} Join failed: {}", "✗".red(), e);
                return;
            }
        };

    println!("{} Joined room {}", "✓".green(), room_id.green().bold());
    println!("Press {} to leave.", "Ctrl+C".bold());

    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => print_server_message(&message),
                None => {
                    println!("{} Connection closed", "✗".yellow());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                client.leave().await;
                println!("\n{} Left room", "✓".green());
                break;
            }
        }
    }
}

fn print_server_message(message: &ServerMessage) {
    match message {
        ServerMessage::CandidateJoined { candidate_id, .. } => {
            println!("{} candidate joined: {}", "◀".green(), candidate_id.bold())
        }
        ServerMessage::CandidateLeft { candidate_id } => {
            println!("{} candidate left: {}", "◀".yellow(), candidate_id.bold())
        }
        ServerMessage::AdminLeft { admin_id } => println!("{} proctor left: {}", "◀".yellow(), admin_id.bold()),
        ServerMessage::AdminReplaced { replaced_by, .. } => {
            println!("{} replaced by another proctor connection: {}", "✗".red(), replaced_by)
        }
        ServerMessage::WebrtcSignal(signal) => println!(
            "{} {} from {}{}",
            "◀".green(),
            signal.signal.kind().cyan(),
            signal.from_id.bold(),
            signal
                .to_id
                .as_deref()
                .map(|to| format!(" to {}", to))
                .unwrap_or_default()
        ),
        ServerMessage::RoomError { message } => println!("{} {}", "✗".red(), message),
        ServerMessage::RoomJoined { .. } => {}
    }
}

async fn inspect_lockout(path: &str) {
    let store = match FileSessionStore::open(path).await {
        Ok(store) => store,
        Err(e) => {
            println!("{} Cannot open session store {}: {}", "✗".red(), path, e);
            return;
        }
    };

    let now = proctor_relay::protocol::now_millis();
    match check_lockout(&store, now).await {
        Ok(LockoutStatus::Locked { reason, until }) => {
            let view = TerminalView::for_tag(reason.as_deref());
            let minutes_left = until.saturating_sub(now) / 60_000;
            println!("{} Session locked out", "✗".red().bold());
            println!("  Reason: {}", reason.as_deref().unwrap_or("unknown"));
            println!("  Remaining: ~{} min", minutes_left);
            println!("  {}", view.message());
        }
        Ok(LockoutStatus::Clear) => {
            println!("{} No lockout in force", "✓".green());
            if let Ok(StoredSession::Active {
                assessment_id,
                time_remaining_minutes,
            }) = stored_session(&store, now).await
            {
                println!("  Assessment: {}", assessment_id.as_deref().unwrap_or("none"));
                println!("  Time remaining: {} min", time_remaining_minutes);
            }
        }
        Err(e) => println!("{} Failed to read lockout markers: {}", "✗".red(), e),
    }
}

/// Stand-in for the camera: reports whatever was last picked with
/// `--face` or a `face` line on stdin.
struct TerminalFaces(watch::Receiver<FaceClassification>);

#[async_trait]
impl FaceClassifier for TerminalFaces {
    async fn classify(&self) -> proctor_relay::Result<FaceClassification> {
        Ok(*self.0.borrow())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TerminalInput {
    Visibility(Visibility),
    Face(FaceClassification),
}

fn parse_terminal_input(line: &str) -> Option<TerminalInput> {
    let mut words = line.split_whitespace();
    let input = match (words.next()?, words.next()) {
        ("hide", None) => TerminalInput::Visibility(Visibility::Hidden),
        ("show", None) => TerminalInput::Visibility(Visibility::Visible),
        ("face", Some(count)) => TerminalInput::Face(FaceArg::from_str(count, true).ok()?.into()),
        _ => return None,
    };
    words.next().is_none().then_some(input)
}

async fn run_candidate(server: &str, assessment_id: &str, candidate_id: &str, api: Option<&str>, face: FaceArg) {
    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };
    config.api.signaling_url = format!("ws://{}/signaling", server);
    let api_base = api.map(str::to_string).unwrap_or_else(|| config.api.base_url.clone());

    let setup = async {
        let api = Arc::new(ApiClient::new(api_base)?);
        let store = Arc::new(FileSessionStore::open(config.session.store_path.clone()).await?);
        let links = Arc::new(WebRtcLinkFactory::new(&config.webrtc)?);
        Ok::<_, proctor_relay::ProctorError>((api, store, links))
    };
    let (api, store, links) = match setup.await {
        Ok(parts) => parts,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };

    let (navigator, mut terminal) = ChannelNavigator::new();
    let (faces_tx, faces) = watch::channel(FaceClassification::from(face));
    let services = SessionServices {
        store,
        metadata: api.clone(),
        rooms: api.clone(),
        recorder: api,
        navigator: Arc::new(navigator),
        links,
        device: Arc::new(CaptureDevice::new("default camera")),
        classifier: Arc::new(TerminalFaces(faces)),
    };
    let identity = SessionIdentity {
        candidate_id: candidate_id.to_string(),
        assessment_id: assessment_id.to_string(),
    };

    let (notices_tx, mut notices) = mpsc::unbounded_channel();
    let session = CandidateSession::new(Arc::new(config), identity, services).with_notices(notices_tx);

    let (visibility_tx, visibility) = mpsc::unbounded_channel();
    let (_retry_tx, retry_device) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_terminal_input(&line) {
                Some(TerminalInput::Visibility(event)) => {
                    if visibility_tx.send(event).is_err() {
                        break;
                    }
                }
                Some(TerminalInput::Face(classification)) => {
                    faces_tx.send_replace(classification);
                }
                None if line.trim().is_empty() => {}
                None => println!("{} Expected hide, show or face none|one|many", "?".yellow()),
            }
        }
    });

    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                IntegrityNotice::TabSwitchWarning { count, remaining, .. } => println!(
                    "{} Tab switch {} detected, {} left before the session ends",
                    "⚠".yellow(),
                    count,
                    remaining
                ),
                IntegrityNotice::FaceWarning(warning) => {
                    println!("{} {} ({})", "⚠".yellow(), warning.message, warning.count)
                }
                IntegrityNotice::SeverityChanged(severity) => {
                    println!("{} Time severity: {:?}", "⏱".cyan(), severity)
                }
            }
        }
    });

    println!("{}", "Starting candidate session...".cyan());
    let inputs = SessionInputs {
        visibility,
        retry_device,
    };
    match session.run(inputs).await {
        Ok(SessionEnd::LockedOut(view)) => {
            println!("{} {}", "✗".red().bold(), view.message());
        }
        Ok(SessionEnd::Terminated(reason)) => {
            println!("{} Session ended: {}", "✗".red().bold(), reason);
            if let Some(view) = terminal.borrow_and_update().clone() {
                println!("  {}", view.message());
            }
        }
        Err(e) => println!("{} Session failed: {}", "✗".red(), e),
    }
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    println!("  {} - Basic WebSocket connection test", "connection".cyan());
    println!("  {} - Join acknowledgment", "join-ack".cyan());
    println!("  {} - Offer/answer relay between proctor and candidate", "relay".cyan());
    println!("  {} - Second proctor replaces the first", "admin-replace".cyan());
    println!("  {} - Join without ids (error handling)", "invalid-join".cyan());
    println!("  {} - Room directory create and patch", "rooms".cyan());
    println!("\nExample: proctor-cli validate --scenario relay");
}

async fn run_scenario(server: &str, scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    let result = match scenario {
        "connection" => validate_connection(server).await,
        "join-ack" => validate_join_ack(server).await,
        "relay" => validate_relay(server).await,
        "admin-replace" => validate_admin_replace(server).await,
        "invalid-join" => validate_invalid_join(server).await,
        "rooms" => validate_rooms(server).await,
        _ => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
            return;
        }
    };

    if result {
        println!("\n{} Scenario passed", "✓".green().bold());
    } else {
        println!("\n{} Scenario failed", "✗".red().bold());
    }
}

async fn run_all_validations(server: &str) {
    println!("\n{}", "Running All Validation Tests".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let scenarios = ["connection", "join-ack", "relay", "admin-replace", "invalid-join", "rooms"];
    let mut passed = 0;
    for scenario in scenarios {
        println!("{} {}", "▶".cyan(), scenario.bold());
        let ok = match scenario {
            "connection" => validate_connection(server).await,
            "join-ack" => validate_join_ack(server).await,
            "relay" => validate_relay(server).await,
            "admin-replace" => validate_admin_replace(server).await,
            "invalid-join" => validate_invalid_join(server).await,
            _ => validate_rooms(server).await,
        };
        if ok {
            passed += 1;
        }
        println!();
    }

    println!("{}", "═".repeat(60).green());
    let summary = format!("{}/{} scenarios passed", passed, scenarios.len());
    if passed == scenarios.len() {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.red().bold());
    }
}

async fn open(server: &str) -> Option<(WsWrite, WsRead)> {
    let url = format!("ws://{}/signaling", server);
    match connect_async(&url).await {
        Ok((ws_stream, _)) => Some(ws_stream.split()),
        Err(e) => {
            println!("{} Connection failed: {}", "✗".red(), e);
            None
        }
    }
}

async fn send_event(write: &mut WsWrite, event: &str, data: serde_json::Value) -> bool {
    let frame = json!({ "event": event, "data": data });
    if write.send(Message::Text(frame.to_string())).await.is_err() {
        println!("{} Failed to send {}", "✗".red(), event);
        return false;
    }
    true
}

/// Next frame carrying `event`, skipping anything else.
async fn expect_event(read: &mut WsRead, event: &str) -> Option<serde_json::Value> {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                    continue;
                };
                if frame["event"] == event {
                    return Some(frame["data"].clone());
                }
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => {
                println!("{} Error receiving message: {}", "✗".red(), e);
                return None;
            }
            Ok(None) => {
                println!("{} Connection closed by server", "✗".red());
                return None;
            }
            Err(_) => {
                println!("{} Timeout waiting for {}", "✗".red(), event);
                return None;
            }
        }
    }
}

async fn join(write: &mut WsWrite, read: &mut WsRead, room_id: &str, user_id: &str, admin: bool) -> bool {
    let data = json!({ "roomId": room_id, "userId": user_id, "isAdmin": admin });
    send_event(write, "join-room", data).await && expect_event(read, "room-joined").await.is_some()
}

async fn validate_connection(server: &str) -> bool {
    match open(server).await {
        Some(_) => {
            println!("{} WebSocket connection established", "✓".green());
            true
        }
        None => false,
    }
}

async fn validate_join_ack(server: &str) -> bool {
    let Some((mut write, mut read)) = open(server).await else {
        return false;
    };
    if join(&mut write, &mut read, "cli-ack", "cli-candidate", false).await {
        println!("{} room-joined received", "✓".green());
        true
    } else {
        false
    }
}

async fn validate_relay(server: &str) -> bool {
    println!("  Step 1: Proctor A1 joins R1...");
    let Some((mut admin_write, mut admin_read)) = open(server).await else {
        return false;
    };
    if !join(&mut admin_write, &mut admin_read, "cli-R1", "A1", true).await {
        return false;
    }

    println!("  Step 2: Candidate C1 joins R1...");
    let Some((mut cand_write, mut cand_read)) = open(server).await else {
        return false;
    };
    if !join(&mut cand_write, &mut cand_read, "cli-R1", "C1", false).await {
        return false;
    }
    if expect_event(&mut admin_read, "candidate-joined").await.is_none() {
        return false;
    }
    println!("  {} Proctor notified of candidate", "✓".green());

    println!("  Step 3: Candidate sends offer...");
    let offer = json!({
        "roomId": "cli-R1",
        "fromId": "C1",
        "type": "offer",
        "signal": { "type": "offer", "sdp": "v=0" },
        "timestamp": proctor_relay::protocol::now_millis(),
    });
    if !send_event(&mut cand_write, "webrtc-signal", offer.clone()).await {
        return false;
    }
    match expect_event(&mut admin_read, "webrtc-signal").await {
        Some(data) if data == offer => println!("  {} Offer forwarded verbatim", "✓".green()),
        Some(data) => {
            println!("{} Offer altered in transit: {}", "✗".red(), data);
            return false;
        }
        None => return false,
    }

    println!("  Step 4: Proctor answers...");
    let answer = json!({
        "roomId": "cli-R1",
        "fromId": "A1",
        "toId": "C1",
        "type": "answer",
        "signal": { "type": "answer", "sdp": "v=0" },
        "timestamp": proctor_relay::protocol::now_millis(),
    });
    if !send_event(&mut admin_write, "webrtc-signal", answer).await {
        return false;
    }
    match expect_event(&mut cand_read, "webrtc-signal").await {
        Some(data) if data["type"] == "answer" => {
            println!("  {} Answer delivered to candidate", "✓".green());
            true
        }
        _ => false,
    }
}

async fn validate_admin_replace(server: &str) -> bool {
    let Some((mut first_write, mut first_read)) = open(server).await else {
        return false;
    };
    if !join(&mut first_write, &mut first_read, "cli-replace", "A1", true).await {
        return false;
    }
    let Some((mut second_write, mut second_read)) = open(server).await else {
        return false;
    };
    if !join(&mut second_write, &mut second_read, "cli-replace", "A2", true).await {
        return false;
    }

    match expect_event(&mut first_read, "admin-replaced").await {
        Some(data) if data["replacedBy"] == "A2" => {
            println!("{} First proctor told it was replaced", "✓".green());
            true
        }
        _ => false,
    }
}

async fn validate_invalid_join(server: &str) -> bool {
    let Some((mut write, mut read)) = open(server).await else {
        return false;
    };
    let data = json!({ "roomId": "", "userId": "", "isAdmin": false });
    if !send_event(&mut write, "join-room", data).await {
        return false;
    }
    match expect_event(&mut read, "room-error").await {
        Some(data) => {
            println!("{} Rejected: {}", "✓".green(), data["message"].as_str().unwrap_or(""));
            true
        }
        None => false,
    }
}

async fn validate_rooms(server: &str) -> bool {
    let client = reqwest::Client::new();
    let base = format!("http://{}/api/v1/rooms", server);

    let created = match client
        .post(&base)
        .json(&json!({ "assessmentId": "cli-assessment", "candidateId": "cli-candidate" }))
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => resp.json::<serde_json::Value>().await.ok(),
        Ok(resp) => {
            println!("{} Room creation failed: {}", "✗".red(), resp.status());
            None
        }
        Err(e) => {
            println!("{} Cannot connect to server: {}", "✗".red(), e);
            None
        }
    };
    let Some(room_id) = created.and_then(|room| room["roomId"].as_str().map(str::to_string)) else {
        return false;
    };
    println!("  {} Room {} ready", "✓".green(), room_id);

    let url = format!("{}/{}/candidates/cli-candidate", base, room_id);
    match client.patch(&url).json(&json!({ "status": "active" })).send().await {
        Ok(resp) if resp.status().is_success() => {
            let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
            println!("  {} Candidate now {}", "✓".green(), body["attemptStatus"]);
            body["attemptStatus"] == "IN_PROGRESS"
        }
        Ok(resp) => {
            println!("{} Patch failed: {}", "✗".red(), resp.status());
            false
        }
        Err(e) => {
            println!("{} Patch failed: {}", "✗".red(), e);
            false
        }
    }
}
