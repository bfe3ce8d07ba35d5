use courier::application_impl::*;
use courier::application_port::*;
use courier::domain_model::*;
use courier::infra_memory::MemoryDatabase;
use courier::logger::*;
use courier::settings::*;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "\
commands:
  <text>            send as yourself
  /as <text>        send as the partner
  /view             show the thread and mark it seen
  /list             show conversations
  /retry <local-id> resend a failed message
  /drop             drop every feed connection
  /offline /online  toggle backend connectivity
  /reject on|off    make inserts fail
  /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    info!(?project_settings);
    let logger_config = LogConfig {
        filter: project_settings.log.filter.clone(),
    };
    logger.reload_from_config(&logger_config)?;
    debug!(filter = %logger.current_filter()?, "logging configured");
    let config = project_settings.sync.to_config();

    let db = match project_settings.backend.kind.as_str() {
        "memory" => MemoryDatabase::new(),
        other => return Err(anyhow::anyhow!("unsupported backend kind: {other}")),
    };
    let me = db.add_user(&cli.user);
    let partner = db.add_user(&cli.partner);

    let session = MessagingSession::connect(db.ports_for(me.id), config).await?;
    let remote = MessagingSession::connect(db.ports_for(partner.id), config).await?;
    remote.activate_conversation(me.id).await?;
    session.activate_conversation(partner.id).await?;
    session.load_conversations().await?;

    println!("signed in as {} talking to {}", me.username, partner.username);
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "/quit" => break,
            "/help" => {
                println!("{HELP}");
                Ok(())
            }
            "/as" => remote.send_message(rest).await.map(|_| ()),
            "/view" => session.thread_rendered().await.map(|n| {
                println!("marked {n} message(s) seen");
            }),
            "/list" => {
                print_conversations(&session.conversations());
                Ok(())
            }
            "/retry" => session
                .retry_send(&LocalId(rest.to_owned()))
                .await
                .map(|_| ()),
            "/drop" => {
                db.drop_connections();
                Ok(())
            }
            "/offline" => {
                db.set_online(false);
                Ok(())
            }
            "/online" => {
                db.set_online(true);
                Ok(())
            }
            "/reject" => {
                db.set_reject_inserts(rest == "on");
                Ok(())
            }
            "" => Ok(()),
            _ => session.send_message(line).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!("{e}");
        }

        // let echoes and acknowledgments land before drawing
        tokio::time::sleep(Duration::from_millis(50)).await;
        print_thread(&session.ordered_messages(), me.id);
    }

    remote.dispose().await;
    session.dispose().await;
    Ok(())
}

fn print_thread(messages: &[Message], me: UserId) {
    println!("----");
    for message in messages {
        let who = message
            .sender_profile
            .as_ref()
            .map(|p| p.display_name().to_owned())
            .unwrap_or_else(|| message.sender.to_string());
        let marker = match (&message.status, message.sender == me) {
            (SendStatus::Pending, _) => "…".to_owned(),
            (SendStatus::Failed(reason), _) => format!("failed ({reason}) [{}]", message.key),
            (SendStatus::Confirmed, true) => match message.delivery_state() {
                DeliveryState::Sent => "✓".to_owned(),
                DeliveryState::Delivered => "✓✓".to_owned(),
                DeliveryState::Seen => "seen".to_owned(),
            },
            (SendStatus::Confirmed, false) => String::new(),
        };
        println!(
            "{} {who}: {} {marker}",
            message.created_at.format("%H:%M:%S"),
            message.content
        );
    }
}

fn print_conversations(conversations: &[ConversationSummary]) {
    for summary in conversations {
        let name = summary
            .partner
            .as_ref()
            .map(|p| p.display_name().to_owned())
            .unwrap_or_else(|| summary.partner_id.to_string());
        let preview = summary
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!("{name}: {preview}");
    }
}
