use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, AuthSession, ClickOutcome, HttpSeatApi, ReservationController,
    ReservationError, ReservationEvent, SeatApi, SeatList, SeatScope, SeatView, Settings,
};
use shared::{
    domain::{EventId, Role, SeatId},
    protocol::RegisterRequest,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the API url from client.toml / EMS_API_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Restricts the seat list to one event.
    #[arg(long)]
    event_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account with --username/--password, then exit.
    Register {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// Sign up as an organizer instead of a participant.
        #[arg(long)]
        organizer: bool,
    },
    /// Print the seat list.
    Seats,
    /// Create a seat (setup).
    CreateSeat {
        #[arg(long)]
        number: String,
    },
    /// Interactive booking session.
    Book,
}

#[derive(Debug, PartialEq, Eq)]
enum BookCommand {
    List,
    Click(String),
    Lock(String),
    Confirm,
    Release,
    Refresh,
    Status,
    Quit,
}

fn parse_book_command(line: &str) -> Result<Option<BookCommand>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let label = parts.next().map(str::to_string);
    let command = match (verb.to_ascii_lowercase().as_str(), label) {
        ("list" | "ls", _) => BookCommand::List,
        ("click", Some(label)) => BookCommand::Click(label),
        ("lock", Some(label)) => BookCommand::Lock(label),
        ("click" | "lock", None) => bail!("usage: {verb} <seat number>"),
        ("confirm", _) => BookCommand::Confirm,
        ("release", _) => BookCommand::Release,
        ("refresh", _) => BookCommand::Refresh,
        ("status", _) => BookCommand::Status,
        ("quit" | "exit", _) => BookCommand::Quit,
        (other, _) => bail!("unknown command '{other}'"),
    };
    Ok(Some(command))
}

fn print_seats(seats: &SeatList) {
    for seat in seats.iter() {
        match seat.locked_by() {
            Some(holder) => println!("{:>6}  {:<9} {}", seat.seat_number, seat.status(), holder),
            None => println!("{:>6}  {}", seat.seat_number, seat.status()),
        }
    }
}

fn format_time_left(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

async fn seat_by_label(controller: &ReservationController, label: &str) -> Result<SeatId> {
    controller
        .seats()
        .await
        .find_by_number(label)
        .map(|seat| seat.id)
        .with_context(|| format!("no seat labelled {label}"))
}

fn spawn_event_printer(view: &SeatView) {
    let mut events = view.controller().subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ReservationEvent::SessionStarted(session) => println!(
                    "locked {} ({} left)",
                    session.seat_number,
                    format_time_left(session.time_left)
                ),
                ReservationEvent::SessionReopened(session) => println!(
                    "seat {} is yours, {} left; confirm or release",
                    session.seat_number,
                    format_time_left(session.time_left)
                ),
                ReservationEvent::Tick { time_left, .. } if time_left % 60 == 0 || time_left <= 10 => {
                    println!("{} left", format_time_left(time_left));
                }
                ReservationEvent::SessionEnded {
                    seat_number,
                    reason,
                    ..
                } => println!("session for {seat_number} ended: {reason:?}"),
                ReservationEvent::ActionFailed { action, message } => {
                    println!("{action} failed: {message}");
                }
                _ => {}
            }
        }
    });

    let mut status = view.feed_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[feed: {current:?}]");
        }
    });
}

async fn run_book_command(controller: &Arc<ReservationController>, command: BookCommand) -> Result<()> {
    match command {
        BookCommand::List => print_seats(&controller.seats().await),
        BookCommand::Refresh => print_seats(&controller.refresh_seats().await?),
        BookCommand::Click(label) => {
            let seat_id = seat_by_label(controller, &label).await?;
            if controller.click(seat_id).await? == ClickOutcome::Ignored {
                println!("seat {label} cannot be selected");
            }
        }
        BookCommand::Lock(label) => {
            let seat_id = seat_by_label(controller, &label).await?;
            controller.lock(seat_id).await?;
        }
        BookCommand::Confirm => {
            controller.confirm().await?;
            println!("booking confirmed");
        }
        BookCommand::Release => {
            controller.release().await?;
            println!("seat released");
        }
        BookCommand::Status => match controller.session().await {
            Some(session) => println!(
                "holding {} since {}, {} left",
                session.seat_number,
                session.lock_acquired_at.format("%H:%M:%S"),
                format_time_left(session.time_left)
            ),
            None => println!("no seat held"),
        },
        BookCommand::Quit => {}
    }
    Ok(())
}

async fn book(api: Arc<dyn SeatApi>, viewer: String, settings: &Settings, scope: SeatScope) -> Result<()> {
    let view = SeatView::mount(api, viewer, settings, scope).await;
    spawn_event_printer(&view);
    print_seats(&view.controller().seats().await);
    println!("commands: list, click <seat>, lock <seat>, confirm, release, refresh, status, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_book_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == BookCommand::Quit {
            break;
        }
        if let Err(err) = run_book_command(view.controller(), command).await {
            // Server-side failures are already printed by the event printer.
            if !matches!(
                err.downcast_ref::<ReservationError>(),
                Some(ReservationError::Client(_))
            ) {
                println!("{err:#}");
            }
        }
    }

    view.unmount().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings = settings.with_api_url(server_url);
    }
    let settings = Arc::new(settings);

    let auth = AuthSession::new(reqwest::Client::new(), Arc::clone(&settings));
    if let Command::Register {
        email,
        full_name,
        phone,
        organizer,
    } = args.command
    {
        let request = RegisterRequest {
            username: args.username,
            password: args.password,
            email,
            full_name,
            phone,
            role: organizer.then_some(Role::Organizer),
        };
        println!("{}", auth.register(&request).await?);
        return Ok(());
    }

    let user = auth.login(&args.username, &args.password).await?;
    println!(
        "Logged in as {} ({:?})",
        user.full_name.as_deref().unwrap_or(&user.username),
        user.role
    );
    let api: Arc<dyn SeatApi> = Arc::new(HttpSeatApi::new(auth.clone()));
    let scope = match args.event_id {
        Some(id) => SeatScope::Event(EventId(id)),
        None => SeatScope::All,
    };

    match args.command {
        Command::Seats => {
            let seats = match scope {
                SeatScope::All => api.list_seats().await?,
                SeatScope::Event(event_id) => api.list_event_seats(event_id).await?,
            };
            print_seats(&seats.into_iter().collect::<SeatList>());
        }
        Command::CreateSeat { number } => {
            let seat = api.create_seat(&number).await?;
            println!("created seat {} (id {})", seat.seat_number, seat.id);
        }
        // Runs before login.
        Command::Register { .. } => {}
        Command::Book => {
            if !user.role.can_book_seats() {
                warn!(role = ?user.role, "desktop: booking refused for role");
                bail!("only participants can book seats");
            }
            book(api, user.username, &settings, scope).await?;
        }
    }

    auth.logout().await;
    Ok(())
}
