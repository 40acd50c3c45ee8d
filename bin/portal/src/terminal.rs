//! Terminal rendering: prompts, feed lines and wave outcomes.

use common::feed::{Feed, WaveEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use wave_client::{FeedUpdate, Portal, PortalError, PortalEvent, SessionChange, WaveOutcome};

enum Flow {
    Continue,
    Quit,
}

pub async fn status(portal: &mut Portal) -> eyre::Result<()> {
    match portal.restore().await? {
        Some(account) => println!("Account: {}", account),
        None => println!("Account: not connected"),
    }
    match portal.session().network() {
        Some(network) => println!("Network: {}", network),
        None => println!("Network: unknown"),
    }
    print_prompt(portal);
    Ok(())
}

pub async fn connect(portal: &mut Portal) -> eyre::Result<()> {
    let account = portal.connect().await?;
    println!("Connected: {}", account);

    let network = portal.ensure_network(true).await?;
    println!("Network: {}", network);
    Ok(())
}

pub async fn wave(portal: &mut Portal, message: &str) -> eyre::Result<()> {
    open_session(portal).await?;
    report_wave(portal.wave(message).await)
}

pub async fn watch(portal: &mut Portal) -> eyre::Result<()> {
    open_session(portal).await?;
    establish(portal, true).await;
    render_feed(portal.feed());

    println!("Type a message to wave. Commands: /refresh /clear /switch /connect /status /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let flow = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(portal, line.trim()).await?,
                None => Flow::Quit,
            },
            event = portal.next_event() => render_event(portal, event).await,
        };

        if let Flow::Quit = flow {
            break;
        }
    }

    Ok(())
}

async fn open_session(portal: &mut Portal) -> eyre::Result<()> {
    if portal.restore().await?.is_none() {
        let account = portal.connect().await?;
        println!("Connected: {}", account);
    }
    Ok(())
}

async fn establish(portal: &mut Portal, allow_switch: bool) {
    match portal.establish(allow_switch).await {
        Ok(()) => {}
        Err(PortalError::WrongNetwork { .. }) => print_prompt(portal),
        // The change itself arrives through `next_event`, which reloads
        Err(PortalError::Stale) => println!("Session changed while loading waves"),
        Err(e) => println!("Could not load waves: {}", e),
    }
}

async fn handle_line(portal: &mut Portal, line: &str) -> eyre::Result<Flow> {
    match line {
        "" => {}
        "/quit" => return Ok(Flow::Quit),
        "/clear" => {
            portal.clear();
            println!("Feed cleared");
        }
        "/refresh" => {
            if portal.refresh().await.is_err() {
                establish(portal, false).await;
            }
            render_feed(portal.feed());
        }
        "/switch" => {
            establish(portal, true).await;
            render_feed(portal.feed());
        }
        "/connect" => match portal.connect().await {
            Ok(account) => {
                println!("Connected: {}", account);
                establish(portal, false).await;
                render_feed(portal.feed());
            }
            Err(e) => println!("Connect failed: {}", e),
        },
        "/status" => {
            let session = portal.session();
            println!(
                "Account: {}",
                session.account().map_or("not connected".to_string(), |a| a.to_string())
            );
            if let Some(network) = session.network() {
                println!("Network: {}", network);
            }
            println!("Feed: {:?}, {} waves", portal.feed_state(), portal.feed().len());
            print_prompt(portal);
        }
        message => {
            // Failures are already reported; the loop keeps running
            let _ = report_wave(portal.wave(message).await);
        }
    }
    Ok(Flow::Continue)
}

async fn render_event(portal: &mut Portal, event: PortalEvent) -> Flow {
    match event {
        PortalEvent::Feed(FeedUpdate::Appended(event)) => print_wave(&event),
        PortalEvent::Feed(_) => {}
        PortalEvent::Session(change) => {
            match &change {
                SessionChange::AccountChanged { current: Some(account), .. } => {
                    println!("Account changed to {}", account)
                }
                SessionChange::AccountChanged { current: None, .. }
                | SessionChange::Disconnected => {
                    println!("Wallet disconnected. Type /connect to reconnect.");
                    return Flow::Continue;
                }
                SessionChange::ChainChanged { current, .. } => {
                    println!("Network changed to {}", current)
                }
            }
            establish(portal, false).await;
            render_feed(portal.feed());
        }
        PortalEvent::AgentClosed => {
            println!("Signing agent went away");
            return Flow::Quit;
        }
    }
    Flow::Continue
}

fn report_wave(outcome: WaveOutcome) -> eyre::Result<()> {
    match outcome {
        WaveOutcome::Confirmed(receipt) => {
            println!("👋 Waved! Block {} (tx {})", receipt.block_number, receipt.tx_hash);
            Ok(())
        }
        WaveOutcome::NotSubmitted(PortalError::UserRejected) => {
            println!("Wave cancelled in the wallet");
            Err(PortalError::UserRejected.into())
        }
        WaveOutcome::NotSubmitted(e) => {
            println!("Wave not sent: {}", e);
            Err(e.into())
        }
        WaveOutcome::Failed(e) => {
            println!("Wave failed after submission: {}", e);
            Err(e.into())
        }
    }
}

fn print_prompt(portal: &Portal) {
    if let Some(prompt) = portal.network_prompt() {
        println!("⚠️  {}", prompt);
        println!("   Type /switch (or run `wave-portal connect`) to change network.");
    }
}

fn render_feed(feed: &Feed) {
    if feed.is_empty() {
        println!("No waves yet");
        return;
    }
    for event in feed.entries() {
        print_wave(event);
    }
}

fn print_wave(event: &WaveEvent) {
    println!(
        "[{}] {}: {}",
        event.timestamp().format("%Y-%m-%d %H:%M:%S"),
        event.sender(),
        event.message()
    );
}
