//! Terminal driver: plays the human (Red) against the engine (Black).
//!
//! The board is drawn as text, moves are typed as from-to coordinates
//! ("b2e2"), and the game result is resolved after every ply: mate,
//! repetition with perpetual-check scoring, or the hundred-ply draw rule.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ai::{search_main, Search, SearchProfile};
use engine::{Move, Position, WIN_VALUE};

fn load_profile() -> Result<SearchProfile> {
    let mut profile = match std::env::var("XIANGQI_PROFILE") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading profile {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing profile {path}"))?
        }
        Err(_) => SearchProfile::default(),
    };
    if let Ok(book) = std::env::var("XIANGQI_BOOK") {
        profile.book_path = Some(PathBuf::from(book));
    }
    Ok(profile)
}

/// The game result after the ply just played, if any. `human_moved` tells
/// whose ply it was; repetition scores are read from the side to move and
/// reoriented to the human.
fn resolve_outcome(pos: &mut Position, human_moved: bool) -> Option<&'static str> {
    if pos.is_mate() {
        return Some(if human_moved {
            "Checkmate. You win."
        } else {
            "Checkmate. You lose."
        });
    }
    let rep = pos.rep_status(3);
    if rep > 0 {
        let value = pos.rep_value(rep);
        let human_value = if human_moved { -value } else { value };
        return Some(if human_value > WIN_VALUE {
            "Perpetual check. You win."
        } else if human_value < -WIN_VALUE {
            "Perpetual check. You lose."
        } else {
            "Draw by repetition."
        });
    }
    if pos.move_num() > 100 {
        return Some("Draw by the move limit.");
    }
    None
}

fn announce(pos: &mut Position, verdict: &str) {
    println!("{}", pos.board_string());
    println!("{verdict}  (enter \"new\" for another game)");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let profile = load_profile()?;
    let mut pos = Position::new();
    let mut search = Search::new(profile);
    info!("engine ready");

    println!("You play Red. Enter moves as from-to coordinates, e.g. b2e2.");
    println!("Commands: new, fen, quit.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        println!("{}", pos.board_string());
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        match input {
            "" => continue,
            "quit" | "exit" => break,
            "new" => {
                pos.startup();
                continue;
            }
            "fen" => {
                println!("{}", pos.to_fen());
                continue;
            }
            _ => {}
        }

        let mv = match Move::from_coords(input) {
            Ok(mv) => mv,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if !pos.legal_move(mv) {
            println!("illegal move");
            continue;
        }
        if !pos.make_move(mv) {
            println!("that move would leave your general in check");
            continue;
        }

        if let Some(verdict) = resolve_outcome(&mut pos, true) {
            announce(&mut pos, verdict);
            pos.startup();
            continue;
        }
        if pos.captured() {
            pos.set_irrev();
        }

        let reply = search_main(&mut pos, &mut search);
        if reply.is_none() || !pos.make_move(reply) {
            println!("The engine has no reply. You win.");
            pos.startup();
            continue;
        }
        println!("engine plays {reply}");
        if pos.in_check() {
            println!("check!");
        }

        if let Some(verdict) = resolve_outcome(&mut pos, false) {
            announce(&mut pos, verdict);
            pos.startup();
            continue;
        }
        if pos.captured() {
            pos.set_irrev();
        }
    }

    Ok(())
}
