//! Xiangqi search: iterative-deepening principal-variation search with
//! quiescence, a direct-mapped transposition table, killer and history
//! heuristics, null-move pruning, and a weighted opening book.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use engine::{
    Move, Position, BAN_VALUE, LIMIT_DEPTH, MATE_VALUE, MAX_GEN_MOVES, NULL_DEPTH, WIN_VALUE,
};

pub const HASH_SIZE: usize = 1 << 20;
const HISTORY_SIZE: usize = 1 << 16;
const RANDOM_MASK: u32 = 7;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("book io error: {0}")]
    BookIo(#[from] std::io::Error),
}

// ---------------- Search profile ----------------

/// Tunable search settings with usable defaults; deserializable so a driver
/// can ship one as JSON. Reproducible runs set `seed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProfile {
    #[serde(default = "default_move_time_ms")]
    pub move_time_ms: u64,
    #[serde(default = "default_max_depth")]
    pub max_depth: i32,
    #[serde(default = "default_use_book")]
    pub use_book: bool,
    #[serde(default)]
    pub book_path: Option<PathBuf>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_move_time_ms() -> u64 {
    1000
}
fn default_max_depth() -> i32 {
    LIMIT_DEPTH
}
fn default_use_book() -> bool {
    true
}

impl Default for SearchProfile {
    fn default() -> Self {
        Self {
            move_time_ms: default_move_time_ms(),
            max_depth: default_max_depth(),
            use_book: default_use_book(),
            book_path: None,
            seed: None,
        }
    }
}

// ---------------- Transposition table ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashFlag {
    Alpha,
    Beta,
    Pv,
}

#[derive(Debug, Clone, Copy)]
struct HashEntry {
    depth: i32,
    flag: HashFlag,
    value: i32,
    mv: Move,
    lock0: u32,
    lock1: u32,
}

impl Default for HashEntry {
    fn default() -> Self {
        Self {
            depth: 0,
            flag: HashFlag::Alpha,
            value: 0,
            mv: Move::NONE,
            lock0: 0,
            lock1: 0,
        }
    }
}

// ---------------- Opening book ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookEntry {
    pub lock: u32,
    pub mv: Move,
    pub weight: i32,
}

/// Book records sorted ascending by `lock` (the `lock1` word of the keyed
/// position), loaded from a comma-separated text file.
#[derive(Debug, Clone, Default)]
pub struct OpeningBook {
    entries: Vec<BookEntry>,
}

impl OpeningBook {
    pub fn load(path: &Path) -> Result<OpeningBook, AiError> {
        let file = File::open(path)?;
        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            match parse_book_line(&line) {
                Some(entry) => entries.push(entry),
                None => {
                    if !line.trim().is_empty() {
                        debug!(line = index + 1, "skipping malformed book line");
                    }
                }
            }
        }
        Ok(OpeningBook { entries })
    }

    pub fn from_entries(entries: Vec<BookEntry>) -> OpeningBook {
        OpeningBook { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_book_line(line: &str) -> Option<BookEntry> {
    let mut fields = line.trim().split(',');
    let lock: u32 = fields.next()?.trim().parse().ok()?;
    let mv: i32 = fields.next()?.trim().parse().ok()?;
    let weight: i32 = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(BookEntry {
        lock,
        mv: Move(mv as u16),
        weight,
    })
}

// ---------------- Search state ----------------

/// Everything the search mutates outside the position itself: the
/// transposition table, the history and killer tables, the opening book,
/// the tie-break RNG, and the chosen move.
pub struct Search {
    hash: Vec<HashEntry>,
    history: Vec<i32>,
    killers: [[Move; 2]; LIMIT_DEPTH as usize],
    book: OpeningBook,
    rng: StdRng,
    profile: SearchProfile,
    pub mv_result: Move,
}

impl Search {
    pub fn new(profile: SearchProfile) -> Search {
        let book = match (&profile.book_path, profile.use_book) {
            (Some(path), true) => match OpeningBook::load(path) {
                Ok(book) => {
                    debug!(entries = book.len(), path = %path.display(), "opening book loaded");
                    book
                }
                Err(err) => {
                    warn!(%err, path = %path.display(), "opening book unavailable, searching without it");
                    OpeningBook::default()
                }
            },
            _ => OpeningBook::default(),
        };
        Search {
            hash: vec![HashEntry::default(); HASH_SIZE],
            history: vec![0; HISTORY_SIZE],
            killers: [[Move::NONE; 2]; LIMIT_DEPTH as usize],
            book,
            rng: StdRng::seed_from_u64(profile.seed.unwrap_or(0)),
            profile,
            mv_result: Move::NONE,
        }
    }

    pub fn set_book(&mut self, book: OpeningBook) {
        self.book = book;
    }

    pub fn profile(&self) -> &SearchProfile {
        &self.profile
    }

    fn reset_tables(&mut self) {
        self.hash.iter_mut().for_each(|e| *e = HashEntry::default());
        self.history.iter_mut().for_each(|v| *v = 0);
        self.killers = [[Move::NONE; 2]; LIMIT_DEPTH as usize];
    }

    /// Looks the position up in the transposition table. Returns the hash
    /// move (possibly none) and a score; any score above `-MATE_VALUE` is a
    /// usable cutoff. Mate scores are stored distance-independent and are
    /// rebased to the current ply here.
    fn probe_hash(&self, pos: &Position, alpha: i32, beta: i32, depth: i32) -> (i32, Move) {
        let z = pos.zobrist();
        let entry = &self.hash[z.key as usize & (HASH_SIZE - 1)];
        if entry.lock0 != z.lock0 || entry.lock1 != z.lock1 {
            return (-MATE_VALUE, Move::NONE);
        }
        let mv = entry.mv;
        let mut value = entry.value;
        let mut mate = false;
        if value > WIN_VALUE {
            if value < BAN_VALUE {
                // A repetition-tainted score; unsafe to cut on, but the
                // move is still worth trying first.
                return (-MATE_VALUE, mv);
            }
            value -= pos.distance();
            mate = true;
        } else if value < -WIN_VALUE {
            if value > -BAN_VALUE {
                return (-MATE_VALUE, mv);
            }
            value += pos.distance();
            mate = true;
        }
        if entry.depth >= depth || mate {
            match entry.flag {
                HashFlag::Beta => {
                    if value >= beta {
                        return (value, mv);
                    }
                }
                HashFlag::Alpha => {
                    if value <= alpha {
                        return (value, mv);
                    }
                }
                HashFlag::Pv => return (value, mv),
            }
        }
        (-MATE_VALUE, mv)
    }

    /// Stores an entry unless a deeper one already occupies the slot. Mate
    /// scores are made distance-independent; a mate-band score without a
    /// best move is dropped entirely.
    fn record_hash(&mut self, pos: &Position, flag: HashFlag, value: i32, depth: i32, mv: Move) {
        let z = pos.zobrist();
        let entry = &mut self.hash[z.key as usize & (HASH_SIZE - 1)];
        if entry.depth > depth {
            return;
        }
        let stored = if value > WIN_VALUE {
            if mv.is_none() && value <= BAN_VALUE {
                return;
            }
            value + pos.distance()
        } else if value < -WIN_VALUE {
            if mv.is_none() && value >= -BAN_VALUE {
                return;
            }
            value - pos.distance()
        } else {
            value
        };
        *entry = HashEntry {
            depth,
            flag,
            value: stored,
            mv,
            lock0: z.lock0,
            lock1: z.lock1,
        };
    }

    /// Rewards a beta or PV move: bumps its history score and shifts it
    /// into the killer slots for this ply.
    fn set_best_move(&mut self, mv: Move, depth: i32, ply: usize) {
        self.history[mv.0 as usize] += depth * depth;
        let killers = &mut self.killers[ply];
        if killers[0] != mv {
            killers[1] = killers[0];
            killers[0] = mv;
        }
    }
}

// ---------------- Move ordering ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortPhase {
    Hash,
    Killer1,
    Killer2,
    Gen,
    Rest,
}

// Yields the hash move, then the two killers, then the generated moves in
// history order with the already-tried ones skipped.
struct MoveSorter {
    mv_hash: Move,
    killer1: Move,
    killer2: Move,
    phase: SortPhase,
    moves: Vec<Move>,
    index: usize,
}

impl MoveSorter {
    fn new(pos: &Position, search: &Search, mv_hash: Move) -> MoveSorter {
        let ply = pos.distance() as usize;
        MoveSorter {
            mv_hash,
            killer1: search.killers[ply][0],
            killer2: search.killers[ply][1],
            phase: SortPhase::Hash,
            moves: Vec::new(),
            index: 0,
        }
    }

    fn next(&mut self, pos: &Position, search: &Search) -> Option<Move> {
        loop {
            match self.phase {
                SortPhase::Hash => {
                    self.phase = SortPhase::Killer1;
                    if !self.mv_hash.is_none() {
                        return Some(self.mv_hash);
                    }
                }
                SortPhase::Killer1 => {
                    self.phase = SortPhase::Killer2;
                    if self.killer1 != self.mv_hash
                        && !self.killer1.is_none()
                        && pos.legal_move(self.killer1)
                    {
                        return Some(self.killer1);
                    }
                }
                SortPhase::Killer2 => {
                    self.phase = SortPhase::Gen;
                    if self.killer2 != self.mv_hash
                        && !self.killer2.is_none()
                        && pos.legal_move(self.killer2)
                    {
                        return Some(self.killer2);
                    }
                }
                SortPhase::Gen => {
                    self.phase = SortPhase::Rest;
                    self.moves = pos.generate_moves(false);
                    self.moves
                        .sort_by_key(|mv| Reverse(search.history[mv.0 as usize]));
                    self.index = 0;
                }
                SortPhase::Rest => {
                    while self.index < self.moves.len() {
                        let mv = self.moves[self.index];
                        self.index += 1;
                        if mv != self.mv_hash && mv != self.killer1 && mv != self.killer2 {
                            return Some(mv);
                        }
                    }
                    return None;
                }
            }
        }
    }
}

// ---------------- Opening book lookup ----------------

/// Picks a book move for the position, weighted-randomly among the entries
/// whose lock matches; falls back to the mirrored position when the
/// position itself is not in the book. Returns `None` on a miss.
pub fn search_book(pos: &Position, search: &mut Search) -> Option<Move> {
    let entries = &search.book.entries;
    if entries.is_empty() {
        return None;
    }

    let mut mirrored = false;
    let mut lock = pos.zobrist().lock1;
    let mut index = entries.partition_point(|e| e.lock < lock);
    if index == entries.len() || entries[index].lock != lock {
        mirrored = true;
        lock = pos.mirrored().zobrist().lock1;
        index = entries.partition_point(|e| e.lock < lock);
        if index == entries.len() || entries[index].lock != lock {
            return None;
        }
    }

    let mut moves = Vec::new();
    let mut weights = Vec::new();
    let mut total = 0;
    for entry in entries[index..].iter().take_while(|e| e.lock == lock) {
        if moves.len() == MAX_GEN_MOVES {
            // A corrupt book cannot overrun the candidate list.
            break;
        }
        let mv = if mirrored { entry.mv.mirrored() } else { entry.mv };
        if pos.legal_move(mv) {
            moves.push(mv);
            weights.push(entry.weight);
            total += entry.weight;
        }
    }
    if total <= 0 {
        return None;
    }

    let mut roll = search.rng.gen_range(0..total);
    for (mv, weight) in moves.iter().zip(&weights) {
        roll -= weight;
        if roll < 0 {
            return Some(*mv);
        }
    }
    None
}

// ---------------- Search kernel ----------------

fn quiescence(pos: &mut Position, search: &mut Search, mut alpha: i32, beta: i32) -> i32 {
    let rep = pos.rep_status(1);
    if rep != 0 {
        return pos.rep_value(rep);
    }
    if pos.distance() == LIMIT_DEPTH {
        return pos.evaluate();
    }

    let mut best = -MATE_VALUE;
    let moves = if pos.in_check() {
        // Evasions: every move, history-ordered.
        let mut moves = pos.generate_moves(false);
        moves.sort_by_key(|mv| Reverse(search.history[mv.0 as usize]));
        moves
    } else {
        // Stand pat, then captures only.
        let value = pos.evaluate();
        if value > best {
            best = value;
            if value >= beta {
                return value;
            }
            if value > alpha {
                alpha = value;
            }
        }
        let mut moves = pos.generate_moves(true);
        moves.sort_by_key(|&mv| Reverse(pos.mvv_lva(mv)));
        moves
    };

    for mv in moves {
        if !pos.make_move(mv) {
            continue;
        }
        let value = -quiescence(pos, search, -beta, -alpha);
        pos.undo_make_move();
        if value > best {
            best = value;
            if value >= beta {
                return value;
            }
            if value > alpha {
                alpha = value;
            }
        }
    }

    if best == -MATE_VALUE {
        // No playable move while in check: mated, preferring longer lines.
        pos.distance() - MATE_VALUE
    } else {
        best
    }
}

fn search_full(
    pos: &mut Position,
    search: &mut Search,
    mut alpha: i32,
    beta: i32,
    depth: i32,
    no_null: bool,
) -> i32 {
    if depth <= 0 {
        return quiescence(pos, search, alpha, beta);
    }

    let rep = pos.rep_status(1);
    if rep != 0 {
        return pos.rep_value(rep);
    }
    if pos.distance() == LIMIT_DEPTH {
        return pos.evaluate();
    }

    let (value, mv_hash) = search.probe_hash(pos, alpha, beta, depth);
    if value > -MATE_VALUE {
        return value;
    }

    if !no_null && !pos.in_check() && pos.null_okay() {
        pos.null_move();
        let value = -search_full(pos, search, -beta, 1 - beta, depth - NULL_DEPTH - 1, true);
        pos.undo_null_move();
        if value >= beta {
            return value;
        }
    }

    let mut hash_flag = HashFlag::Alpha;
    let mut best = -MATE_VALUE;
    let mut mv_best = Move::NONE;
    let ply = pos.distance() as usize;

    let mut sorter = MoveSorter::new(pos, search, mv_hash);
    while let Some(mv) = sorter.next(pos, search) {
        if !pos.make_move(mv) {
            continue;
        }
        // Check extension.
        let new_depth = if pos.in_check() { depth } else { depth - 1 };
        let value = if best == -MATE_VALUE {
            -search_full(pos, search, -beta, -alpha, new_depth, false)
        } else {
            // PVS: null window first, re-search on a fail inside the window.
            let value = -search_full(pos, search, -alpha - 1, -alpha, new_depth, false);
            if value > alpha && value < beta {
                -search_full(pos, search, -beta, -alpha, new_depth, false)
            } else {
                value
            }
        };
        pos.undo_make_move();

        if value > best {
            best = value;
            if value >= beta {
                hash_flag = HashFlag::Beta;
                mv_best = mv;
                break;
            }
            if value > alpha {
                hash_flag = HashFlag::Pv;
                mv_best = mv;
                alpha = value;
            }
        }
    }

    if best == -MATE_VALUE {
        return pos.distance() - MATE_VALUE;
    }
    search.record_hash(pos, hash_flag, best, depth, mv_best);
    if !mv_best.is_none() {
        search.set_best_move(mv_best, depth, ply);
    }
    best
}

fn search_root(pos: &mut Position, search: &mut Search, depth: i32) -> i32 {
    let mut best = -MATE_VALUE;
    let ply = pos.distance() as usize;

    let mut sorter = MoveSorter::new(pos, search, search.mv_result);
    while let Some(mv) = sorter.next(pos, search) {
        if !pos.make_move(mv) {
            continue;
        }
        let new_depth = if pos.in_check() { depth } else { depth - 1 };
        let value = if best == -MATE_VALUE {
            -search_full(pos, search, -MATE_VALUE, MATE_VALUE, new_depth, true)
        } else {
            let value = -search_full(pos, search, -best - 1, -best, new_depth, false);
            if value > best {
                -search_full(pos, search, -MATE_VALUE, -best, new_depth, true)
            } else {
                value
            }
        };
        pos.undo_make_move();

        if value > best {
            best = value;
            search.mv_result = mv;
            if best > -WIN_VALUE && best < WIN_VALUE {
                // Small jitter so equal moves do not always resolve the
                // same way.
                best += (search.rng.gen::<u32>() & RANDOM_MASK) as i32
                    - (search.rng.gen::<u32>() & RANDOM_MASK) as i32;
            }
        }
    }

    search.record_hash(pos, HashFlag::Pv, best, depth, search.mv_result);
    if !search.mv_result.is_none() {
        search.set_best_move(search.mv_result, depth, ply);
    }
    best
}

/// Computes the reply for the side to move into `search.mv_result` and
/// returns it. Tries the opening book first (unless the book move would
/// walk into a repetition), short-circuits when only one legal move
/// exists, then iteratively deepens until mate, the depth cap, or the
/// time budget.
pub fn search_main(pos: &mut Position, search: &mut Search) -> Move {
    search.reset_tables();
    let start = Instant::now();
    pos.reset_distance();

    let seed = search.profile.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });
    search.rng = StdRng::seed_from_u64(seed);
    search.mv_result = Move::NONE;

    if search.profile.use_book {
        if let Some(mv) = search_book(pos, search) {
            if pos.make_move(mv) {
                let rep = pos.rep_status(3);
                pos.undo_make_move();
                if rep == 0 {
                    search.mv_result = mv;
                    debug!(mv = %mv, "book move");
                    return mv;
                }
                // A repeating book move is discarded; the search decides.
            }
        }
    }

    let mut legal = 0;
    for mv in pos.generate_moves(false) {
        if pos.make_move(mv) {
            pos.undo_make_move();
            search.mv_result = mv;
            legal += 1;
        }
    }
    if legal == 1 {
        return search.mv_result;
    }

    let budget = Duration::from_millis(search.profile.move_time_ms);
    for depth in 1..=search.profile.max_depth.min(LIMIT_DEPTH) {
        let value = search_root(pos, search, depth);
        debug!(
            depth,
            value,
            best = %search.mv_result,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "deepening"
        );
        if value > WIN_VALUE || value < -WIN_VALUE {
            break;
        }
        if start.elapsed() >= budget {
            break;
        }
    }
    search.mv_result
}

// ---------------- Tests ----------------

#[cfg(test)]
mod tests {
    use super::*;
    use engine::Side;
    use std::io::Write;

    fn quiet_profile() -> SearchProfile {
        SearchProfile {
            seed: Some(7),
            use_book: false,
            ..SearchProfile::default()
        }
    }

    fn pos(fen: &str) -> Position {
        Position::from_fen(fen).unwrap()
    }

    #[test]
    fn profile_defaults_from_empty_json() {
        let profile: SearchProfile = serde_json::from_str("{}").unwrap();
        assert_eq!(profile.move_time_ms, 1000);
        assert_eq!(profile.max_depth, LIMIT_DEPTH);
        assert!(profile.use_book);
        assert!(profile.book_path.is_none());
        assert!(profile.seed.is_none());
    }

    #[test]
    fn hash_probe_respects_depth_and_flags() {
        let mut search = Search::new(quiet_profile());
        let p = Position::new();
        let mv = Move::from_coords("b2e2").unwrap();

        search.record_hash(&p, HashFlag::Pv, 123, 5, mv);
        let (value, hash_mv) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 5);
        assert_eq!((value, hash_mv), (123, mv));

        // Not deep enough for a cutoff, but the move still comes back.
        let (value, hash_mv) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 6);
        assert_eq!(value, -MATE_VALUE);
        assert_eq!(hash_mv, mv);

        // A shallower store never displaces a deeper entry.
        search.record_hash(&p, HashFlag::Pv, 777, 3, mv);
        let (value, _) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 5);
        assert_eq!(value, 123);

        // Bound flags only cut on their own side of the window.
        let mut search = Search::new(quiet_profile());
        search.record_hash(&p, HashFlag::Beta, 50, 4, mv);
        let (value, _) = search.probe_hash(&p, -100, 40, 4);
        assert_eq!(value, 50);
        let (value, _) = search.probe_hash(&p, -100, 60, 4);
        assert_eq!(value, -MATE_VALUE);
    }

    #[test]
    fn hash_mate_scores_are_distance_rebased() {
        let mut search = Search::new(quiet_profile());
        let p = Position::new();
        let mv = Move::from_coords("b2e2").unwrap();

        // A true mate score survives and cuts regardless of stored depth.
        search.record_hash(&p, HashFlag::Pv, MATE_VALUE - 2, 1, mv);
        let (value, _) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 9);
        assert_eq!(value, MATE_VALUE - 2);

        // A score in the unsure band is not stored when no move
        // accompanies it.
        let mut search = Search::new(quiet_profile());
        search.record_hash(&p, HashFlag::Pv, WIN_VALUE + 10, 1, Move::NONE);
        let (value, hash_mv) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 1);
        assert_eq!(value, -MATE_VALUE);
        assert!(hash_mv.is_none());

        // With a move it is stored, but only the move is usable.
        let mut search = Search::new(quiet_profile());
        search.record_hash(&p, HashFlag::Pv, WIN_VALUE + 10, 1, mv);
        let (value, hash_mv) = search.probe_hash(&p, -MATE_VALUE, MATE_VALUE, 1);
        assert_eq!(value, -MATE_VALUE);
        assert_eq!(hash_mv, mv);
    }

    #[test]
    fn sorter_yields_hash_then_killers_then_history_order() {
        let p = Position::new();
        let mut search = Search::new(quiet_profile());
        let hash_mv = Move::from_coords("b2e2").unwrap();
        let killer = Move::from_coords("h2e2").unwrap();
        let favored = Move::from_coords("b0c2").unwrap();
        search.killers[0][0] = killer;
        search.history[favored.0 as usize] = 1000;

        let mut sorter = MoveSorter::new(&p, &search, hash_mv);
        assert_eq!(sorter.next(&p, &search), Some(hash_mv));
        assert_eq!(sorter.next(&p, &search), Some(killer));
        assert_eq!(sorter.next(&p, &search), Some(favored));

        let mut seen = vec![hash_mv, killer, favored];
        while let Some(mv) = sorter.next(&p, &search) {
            assert!(!seen.contains(&mv), "move {mv} yielded twice");
            seen.push(mv);
        }
        assert_eq!(seen.len(), 44);
    }

    #[test]
    fn sorter_drops_illegal_killers() {
        let p = Position::new();
        let mut search = Search::new(quiet_profile());
        // A black reply is not legal while Red is to move.
        search.killers[0][0] = Move::from_coords("h9g7").unwrap();
        let mut sorter = MoveSorter::new(&p, &search, Move::NONE);
        let first = sorter.next(&p, &search).unwrap();
        assert!(p.legal_move(first));
        assert_ne!(first, search.killers[0][0]);
    }

    #[test]
    fn book_loads_and_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "12345,100,50").unwrap();
        writeln!(file, "not a record").unwrap();
        writeln!(file, "1,2").unwrap();
        writeln!(file, "1,2,3,4").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "67890,200,25").unwrap();
        file.flush().unwrap();

        let book = OpeningBook::load(file.path()).unwrap();
        assert_eq!(book.len(), 2);

        let missing = OpeningBook::load(Path::new("/no/such/book.dat"));
        assert!(missing.is_err());
    }

    #[test]
    fn book_choice_follows_the_weights() {
        let p = Position::new();
        let lock = p.zobrist().lock1;
        let heavy = Move::from_coords("b2e2").unwrap();
        let light = Move::from_coords("h2e2").unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut lines = [(heavy, 70), (light, 30)];
        lines.sort_by_key(|(mv, _)| mv.0);
        for (mv, weight) in lines {
            writeln!(file, "{},{},{}", lock, mv.0, weight).unwrap();
        }
        file.flush().unwrap();

        let mut search = Search::new(SearchProfile {
            seed: Some(42),
            ..SearchProfile::default()
        });
        search.set_book(OpeningBook::load(file.path()).unwrap());

        let mut heavy_hits = 0u32;
        for _ in 0..10_000 {
            match search_book(&p, &mut search) {
                Some(mv) if mv == heavy => heavy_hits += 1,
                Some(mv) => assert_eq!(mv, light),
                None => panic!("book lookup missed a keyed position"),
            }
        }
        // Within two percent of the 70/30 split.
        assert!((6800..=7200).contains(&heavy_hits), "got {heavy_hits}");
    }

    #[test]
    fn book_falls_back_to_the_mirror() {
        let p = pos("4k4/9/9/9/9/9/9/1C7/9/3K5 w");
        let reply = Move::from_coords("b2e2").unwrap();
        let mirror_lock = p.mirrored().zobrist().lock1;
        let entry = BookEntry {
            lock: mirror_lock,
            mv: reply.mirrored(),
            weight: 100,
        };

        let mut search = Search::new(quiet_profile());
        search.set_book(OpeningBook::from_entries(vec![entry]));
        assert_eq!(search_book(&p, &mut search), Some(reply));

        // A position keyed under neither form misses.
        let other = pos("4k4/9/9/9/9/9/9/9/4C4/3K5 w");
        assert_eq!(search_book(&other, &mut search), None);
    }

    #[test]
    fn lone_reply_is_returned_without_deepening() {
        let mut p = pos("4k4/9/9/9/9/9/9/9/9/3K5 w");
        let mut search = Search::new(quiet_profile());
        let started = Instant::now();
        let mv = search_main(&mut p, &mut search);
        assert_eq!(mv, Move::from_coords("d0d1").unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn search_finds_mate_in_one() {
        let mut p = pos("4k4/1R7/2R6/9/9/9/9/9/9/3K5 w");
        let mut search = Search::new(SearchProfile {
            max_depth: 4,
            move_time_ms: 5000,
            ..quiet_profile()
        });
        let mv = search_main(&mut p, &mut search);
        assert!(!mv.is_none());
        assert!(p.legal_move(mv));
        assert!(p.make_move(mv));
        assert!(p.is_mate(), "reply {mv} did not deliver mate");
    }

    #[test]
    fn deepening_stops_on_the_time_budget() {
        let mut p = Position::new();
        let mut search = Search::new(SearchProfile {
            move_time_ms: 150,
            max_depth: 4,
            ..quiet_profile()
        });
        let started = Instant::now();
        let mv = search_main(&mut p, &mut search);
        assert!(!mv.is_none());
        assert!(p.legal_move(mv));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(mv, search.mv_result);
    }

    #[test]
    fn repeating_book_move_falls_through_to_the_search() {
        let mut p = pos("9/4k4/R8/9/9/9/9/9/9/3K5 w");
        for (red, black) in [
            ("a7a8", "e8e9"),
            ("a8a9", "e9e8"),
            ("a9a8", "e8e9"),
            ("a8a9", "e9e8"),
            ("a9a8", "e8e9"),
            ("a8a9", "e9e8"),
        ] {
            assert!(p.make_move(Move::from_coords(red).unwrap()));
            assert!(p.make_move(Move::from_coords(black).unwrap()));
        }
        // The only book line walks straight back into the repetition.
        let book_mv = Move::from_coords("a9a8").unwrap();
        let entry = BookEntry {
            lock: p.zobrist().lock1,
            mv: book_mv,
            weight: 100,
        };

        let mut search = Search::new(SearchProfile {
            move_time_ms: 100,
            max_depth: 3,
            seed: Some(11),
            ..SearchProfile::default()
        });
        search.set_book(OpeningBook::from_entries(vec![entry]));

        let board_before = *p.board();
        let move_num_before = p.move_num();
        let mv = search_main(&mut p, &mut search);

        assert!(!mv.is_none());
        assert!(p.legal_move(mv));
        assert_eq!(*p.board(), board_before);
        assert_eq!(p.move_num(), move_num_before);
        assert_eq!(p.side(), Side::Red);
    }

    #[test]
    fn search_result_survives_and_plays() {
        let mut p = Position::new();
        let mut search = Search::new(SearchProfile {
            move_time_ms: 100,
            max_depth: 3,
            ..quiet_profile()
        });
        for _ in 0..4 {
            let mv = search_main(&mut p, &mut search);
            assert!(p.legal_move(mv));
            assert!(p.make_move(mv));
        }
    }
}
