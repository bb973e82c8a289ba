use anyhow::{Context, Result};
use clap::Parser;
use live_tutor::capture::{MicrophoneCapture, MicrophoneConfig};
use live_tutor::config::{load_config, LiveConfig};
use live_tutor::persona::LearnerProfile;
use live_tutor::playback::{CpalOutput, CpalOutputConfig};
use live_tutor::session::GeminiLiveTransport;
use live_tutor::tools::{create_default_registry, GeminiImageGenerator, ToolExecutor};
use live_tutor::transcript::{FileHistoryStore, SessionSnapshot, Speaker, TranscriptEntry};
use live_tutor::{Conversation, ConversationDeps, ConversationEvent, ConversationHandle};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Live model to talk to
    #[arg(long)]
    model: Option<String>,

    /// Prebuilt voice of the tutor
    #[arg(long)]
    voice: Option<String>,

    /// Where past sessions are stored
    #[arg(long)]
    history_file: Option<PathBuf>,

    #[arg(long, default_value = "friend")]
    learner_name: String,

    #[arg(long)]
    learner_age: Option<u8>,

    /// Something the learner enjoys (repeatable)
    #[arg(long = "interest")]
    interests: Vec<String>,

    /// Upper bound for a single tool call
    #[arg(long)]
    tool_timeout_secs: Option<u64>,

    /// Microphone name (default device when omitted)
    #[arg(long)]
    input_device: Option<String>,

    /// Speaker name (default device when omitted)
    #[arg(long)]
    output_device: Option<String>,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn live_config(&self) -> LiveConfig {
        let mut config = LiveConfig::default();
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            config.voice_name = voice.clone();
        }
        if let Some(path) = &self.history_file {
            config.history_path = path.clone();
        }
        if let Some(secs) = self.tool_timeout_secs {
            config.tool_timeout = Duration::from_secs(secs);
        }
        config
    }

    fn profile(&self) -> LearnerProfile {
        LearnerProfile {
            name: self.learner_name.clone(),
            age: self.learner_age,
            interests: self.interests.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        live_tutor::devices::print_devices();
        return Ok(());
    }

    log::info!("🚀 Initializing live-tutor");

    let (conversation, handle) = build_conversation(&args).context("Failed to start live tutor")?;
    let mut events = handle.subscribe();
    let conversation_task = tokio::spawn(conversation.run());

    // Interactive stdin gets its own thread so shutdown never waits on a read
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if lines_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    println!("🧑‍🏫 Live tutor ready for {}", args.learner_name);
    println!("   Commands: start, stop, history, quit");
    println!("   Press Ctrl+C to exit");

    loop {
        tokio::select! {
            line = lines_rx.recv() => {
                let Some(line) = line else { break };
                match line.trim() {
                    "start" | "s" => {
                        handle.start();
                    }
                    "stop" | "x" => {
                        handle.stop();
                    }
                    "history" | "h" => {
                        handle.show_history();
                    }
                    "quit" | "q" => break,
                    "" => {}
                    other => println!("Unknown command '{}'", other),
                }
            }

            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Display fell behind, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    handle.shutdown();
    conversation_task
        .await
        .context("Conversation task failed")?;

    println!("\n👋 Goodbye!");
    Ok(())
}

/// Wire real devices, network collaborators and the history file.
fn build_conversation(args: &Args) -> live_tutor::Result<(Conversation, ConversationHandle)> {
    let api = Arc::new(load_config()?);
    let config = args.live_config();

    let output = CpalOutput::new(CpalOutputConfig {
        device_name: args.output_device.clone(),
    })?;
    log::info!("🔊 Audio output ready");

    let capture = MicrophoneCapture::new(MicrophoneConfig {
        device_name: args.input_device.clone(),
        sample_rate: config.input_sample_rate,
        chunk_size: config.capture_chunk_size,
    });

    let images = GeminiImageGenerator::new(Arc::clone(&api), &config)?;
    let tools = ToolExecutor::new(create_default_registry(), Arc::new(images), config.tool_timeout);
    let transport = GeminiLiveTransport::new(Arc::clone(&api), &config);
    let history = FileHistoryStore::new(config.history_path.clone());
    log::info!("📚 History file: {}", history.path().display());

    Ok(Conversation::new(
        config,
        args.profile(),
        ConversationDeps {
            transport: Arc::new(transport),
            capture: Box::new(capture),
            output: Box::new(output),
            tools: Arc::new(tools),
            history: Arc::new(history),
        },
    ))
}

fn print_event(event: &ConversationEvent) {
    match event {
        ConversationEvent::PhaseChanged(phase) => println!("[{}]", phase),
        ConversationEvent::TranscriptUpdated(entry) if entry.is_final => print_entry(entry),
        ConversationEvent::TranscriptUpdated(_) => {}
        ConversationEvent::Notice(message) => println!("⚠️  {}", message),
        ConversationEvent::SessionSaved(snapshot) => {
            println!("💾 Saved session with {} entries", snapshot.transcript.len())
        }
        ConversationEvent::History(snapshots) => print_history(snapshots),
    }
}

fn print_entry(entry: &TranscriptEntry) {
    let who = match entry.source {
        Speaker::User => "🧒",
        Speaker::Model => "🤖",
    };
    println!("{} {}", who, entry.text);
    if let Some(url) = &entry.image_url {
        println!("   🖼️  picture ({} bytes)", url.len());
    }
}

fn print_history(snapshots: &[SessionSnapshot]) {
    if snapshots.is_empty() {
        println!("No past sessions yet");
        return;
    }
    for (i, snapshot) in snapshots.iter().enumerate() {
        println!(
            "#{} {} ({} entries)",
            i + 1,
            snapshot.timestamp.format("%Y-%m-%d %H:%M"),
            snapshot.transcript.len()
        );
        for entry in &snapshot.transcript {
            print!("   ");
            print_entry(entry);
        }
    }
}
