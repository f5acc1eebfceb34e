//! Xiangqi rules engine.
//!
//! The padded 16x16 board, piece encoding, move generation and legality,
//! incremental Zobrist hashing, and the repetition rules. Shared by the
//! search crate and any driver so both see identical move logic.

use std::fmt;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------- Score and size constants ----------------

pub const MAX_GEN_MOVES: usize = 128;
pub const MAX_MOVES: usize = 256;
pub const LIMIT_DEPTH: i32 = 64;

pub const MATE_VALUE: i32 = 10000;
pub const BAN_VALUE: i32 = MATE_VALUE - 100;
pub const WIN_VALUE: i32 = MATE_VALUE - 200;
pub const DRAW_VALUE: i32 = 20;
pub const ADVANCED_VALUE: i32 = 3;
pub const NULL_MARGIN: i32 = 400;
pub const NULL_DEPTH: i32 = 2;

// ---------------- Board geometry ----------------

pub const RANK_TOP: usize = 3;
pub const RANK_BOTTOM: usize = 12;
pub const FILE_LEFT: usize = 3;
pub const FILE_RIGHT: usize = 11;

pub const fn rank_of(sq: usize) -> usize {
    sq >> 4
}

pub const fn file_of(sq: usize) -> usize {
    sq & 15
}

pub const fn make_square(file: usize, rank: usize) -> usize {
    (rank << 4) | file
}

pub const fn in_board(sq: usize) -> bool {
    let rank = rank_of(sq);
    let file = file_of(sq);
    rank >= RANK_TOP && rank <= RANK_BOTTOM && file >= FILE_LEFT && file <= FILE_RIGHT
}

pub const fn in_fort(sq: usize) -> bool {
    let rank = rank_of(sq);
    let file = file_of(sq);
    file >= 6 && file <= 8 && ((rank >= 3 && rank <= 5) || (rank >= 10 && rank <= 12))
}

/// Vertical mirror, used to look up Black pieces in the Red-oriented tables.
pub const fn square_flip(sq: usize) -> usize {
    254 - sq
}

/// Horizontal mirror, used for the opening-book fallback lookup.
pub const fn mirror_square(sq: usize) -> usize {
    (sq & 0xF0) | (14 - (sq & 0x0F))
}

const fn shifted(sq: usize, delta: isize) -> usize {
    (sq as isize + delta) as usize
}

pub const fn same_half(a: usize, b: usize) -> bool {
    ((a ^ b) & 0x80) == 0
}

pub const fn same_rank(a: usize, b: usize) -> bool {
    ((a ^ b) & 0xF0) == 0
}

pub const fn same_file(a: usize, b: usize) -> bool {
    ((a ^ b) & 0x0F) == 0
}

pub const fn jiang_span(src: usize, dst: usize) -> bool {
    matches!(dst as isize - src as isize, -16 | -1 | 1 | 16)
}

pub const fn shi_span(src: usize, dst: usize) -> bool {
    matches!(dst as isize - src as isize, -17 | -15 | 15 | 17)
}

pub const fn xiang_span(src: usize, dst: usize) -> bool {
    matches!(dst as isize - src as isize, -34 | -30 | 30 | 34)
}

/// The elephant "eye": the diagonal square a two-step move hops over.
pub const fn xiang_eye(src: usize, dst: usize) -> usize {
    (src + dst) >> 1
}

/// The orthogonal "leg" square that blocks a horse leap, or `src` itself
/// when the offset is not a horse move at all.
pub const fn ma_leg(src: usize, dst: usize) -> usize {
    match dst as isize - src as isize {
        -33 | -31 => src - 16,
        -18 | 14 => src - 1,
        -14 | 18 => src + 1,
        31 | 33 => src + 16,
        _ => src,
    }
}

pub const JIANG_DELTA: [isize; 4] = [-16, -1, 1, 16];
pub const SHI_DELTA: [isize; 4] = [-17, -15, 15, 17];
pub const MA_DELTA: [[isize; 2]; 4] = [[-33, -31], [-18, 14], [-14, 18], [31, 33]];
pub const MA_CHECK_DELTA: [[isize; 2]; 4] = [[-33, -18], [-31, -14], [14, 31], [18, 33]];

// ---------------- Sides and pieces ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Red,
    Black,
}

impl Side {
    pub const fn opponent(self) -> Side {
        match self {
            Side::Red => Side::Black,
            Side::Black => Side::Red,
        }
    }

    /// The bit that tags this side's piece codes: 0x08 for Red, 0x10 for Black.
    pub const fn tag(self) -> u8 {
        match self {
            Side::Red => 8,
            Side::Black => 16,
        }
    }

    pub const fn opp_tag(self) -> u8 {
        self.opponent().tag()
    }
}

pub const fn square_forward(sq: usize, side: Side) -> usize {
    match side {
        Side::Red => sq - 16,
        Side::Black => sq + 16,
    }
}

/// Own half of the river for `side`.
pub const fn home_half(sq: usize, side: Side) -> bool {
    match side {
        Side::Red => sq & 0x80 != 0,
        Side::Black => sq & 0x80 == 0,
    }
}

/// Past the river for `side`; soldiers gain sideways steps here.
pub const fn crossed_river(sq: usize, side: Side) -> bool {
    !home_half(sq, side)
}

pub const PIECE_JIANG: u8 = 0;
pub const PIECE_SHI: u8 = 1;
pub const PIECE_XIANG: u8 = 2;
pub const PIECE_MA: u8 = 3;
pub const PIECE_JU: u8 = 4;
pub const PIECE_PAO: u8 = 5;
pub const PIECE_BING: u8 = 6;

fn piece_char(pc: u8) -> char {
    const RED: [char; 7] = ['K', 'A', 'B', 'N', 'R', 'C', 'P'];
    const BLACK: [char; 7] = ['k', 'a', 'b', 'n', 'r', 'c', 'p'];
    if pc & 8 != 0 {
        RED[(pc - 8) as usize]
    } else if pc & 16 != 0 {
        BLACK[(pc - 16) as usize]
    } else {
        '.'
    }
}

fn piece_from_char(ch: char) -> Option<u8> {
    let kind = match ch.to_ascii_uppercase() {
        'K' => PIECE_JIANG,
        'A' => PIECE_SHI,
        'B' | 'E' => PIECE_XIANG,
        'N' | 'H' => PIECE_MA,
        'R' => PIECE_JU,
        'C' => PIECE_PAO,
        'P' => PIECE_BING,
        _ => return None,
    };
    let tag = if ch.is_ascii_uppercase() {
        Side::Red.tag()
    } else {
        Side::Black.tag()
    };
    Some(tag + kind)
}

// ---------------- Errors ----------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid square token: {0}")]
    InvalidSquare(String),
    #[error("invalid move token: {0}")]
    InvalidMove(String),
    #[error("invalid fen: {0}")]
    InvalidFen(String),
}

// ---------------- Moves ----------------

/// A move packed into 16 bits: source square in the low byte, destination
/// in the high byte. `Move::NONE` (all zero) means "no move".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Move(pub u16);

impl Move {
    pub const NONE: Move = Move(0);

    pub const fn new(src: usize, dst: usize) -> Move {
        Move((src | (dst << 8)) as u16)
    }

    pub const fn src(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    pub const fn dst(self) -> usize {
        (self.0 >> 8) as usize
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn mirrored(self) -> Move {
        Move::new(mirror_square(self.src()), mirror_square(self.dst()))
    }

    pub fn from_coords(token: &str) -> Result<Move, EngineError> {
        if token.len() != 4 || !token.is_ascii() {
            return Err(EngineError::InvalidMove(token.to_string()));
        }
        let (src, dst) = token.split_at(2);
        Ok(Move::new(square_from_coords(src)?, square_from_coords(dst)?))
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "----");
        }
        write!(
            f,
            "{}{}",
            square_to_coords(self.src()),
            square_to_coords(self.dst())
        )
    }
}

/// Formats a square as file letter plus rank digit, "a0" at Red's left corner.
pub fn square_to_coords(sq: usize) -> String {
    let file = (b'a' + (file_of(sq) - FILE_LEFT) as u8) as char;
    format!("{}{}", file, RANK_BOTTOM - rank_of(sq))
}

pub fn square_from_coords(token: &str) -> Result<usize, EngineError> {
    let bad = || EngineError::InvalidSquare(token.to_string());
    let mut chars = token.chars();
    let file_ch = chars.next().ok_or_else(bad)?;
    let rank_ch = chars.next().ok_or_else(bad)?;
    if chars.next().is_some() {
        return Err(bad());
    }
    let file = match file_ch.to_ascii_lowercase() {
        c @ 'a'..='i' => FILE_LEFT + (c as usize - 'a' as usize),
        _ => return Err(bad()),
    };
    let rank = match rank_ch {
        c @ '0'..='9' => RANK_BOTTOM - (c as usize - '0' as usize),
        _ => return Err(bad()),
    };
    Ok(make_square(file, rank))
}

// ---------------- Zobrist keying ----------------

// RC4 keyed with the all-zero key. The stream is fixed, so every build
// produces the same tables and stays compatible with existing book files.
struct Rc4 {
    state: [u8; 256],
    x: usize,
    y: usize,
}

impl Rc4 {
    fn with_zero_key() -> Rc4 {
        let mut state = [0u8; 256];
        let mut i = 0;
        while i < 256 {
            state[i] = i as u8;
            i += 1;
        }
        let mut j = 0usize;
        for i in 0..256 {
            j = (j + state[i] as usize) & 255;
            state.swap(i, j);
        }
        Rc4 { state, x: 0, y: 0 }
    }

    fn next_byte(&mut self) -> u8 {
        self.x = (self.x + 1) & 255;
        self.y = (self.y + self.state[self.x] as usize) & 255;
        self.state.swap(self.x, self.y);
        self.state[(self.state[self.x] as usize + self.state[self.y] as usize) & 255]
    }

    fn next_u32(&mut self) -> u32 {
        let b0 = self.next_byte() as u32;
        let b1 = self.next_byte() as u32;
        let b2 = self.next_byte() as u32;
        let b3 = self.next_byte() as u32;
        b0 | (b1 << 8) | (b2 << 16) | (b3 << 24)
    }
}

/// A 96-bit position signature: `key` indexes the transposition table,
/// `lock0`/`lock1` verify entries, `lock1` keys the opening book.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZobristKey {
    pub key: u32,
    pub lock0: u32,
    pub lock1: u32,
}

impl ZobristKey {
    fn from_rc4(rc4: &mut Rc4) -> ZobristKey {
        ZobristKey {
            key: rc4.next_u32(),
            lock0: rc4.next_u32(),
            lock1: rc4.next_u32(),
        }
    }
}

impl std::ops::BitXorAssign for ZobristKey {
    fn bitxor_assign(&mut self, rhs: ZobristKey) {
        self.key ^= rhs.key;
        self.lock0 ^= rhs.lock0;
        self.lock1 ^= rhs.lock1;
    }
}

struct ZobristTables {
    player: ZobristKey,
    table: Box<[[ZobristKey; 256]; 14]>,
}

static ZOBRIST: Lazy<ZobristTables> = Lazy::new(|| {
    let mut rc4 = Rc4::with_zero_key();
    let player = ZobristKey::from_rc4(&mut rc4);
    let mut table = Box::new([[ZobristKey::default(); 256]; 14]);
    for piece in table.iter_mut() {
        for entry in piece.iter_mut() {
            *entry = ZobristKey::from_rc4(&mut rc4);
        }
    }
    ZobristTables { player, table }
});

// Red pieces 8..=14 map to rows 0..=6, black pieces 16..=22 to rows 7..=13.
const fn zobrist_row(pc: u8) -> usize {
    if pc < 16 {
        (pc - 8) as usize
    } else {
        (pc - 9) as usize
    }
}

// ---------------- Position ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MoveRecord {
    mv: Move,
    captured: u8,
    check: bool,
    key: u32,
}

/// The complete game state: board, side to move, incremental material and
/// Zobrist signature, and the history stack driving repetition detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    side: Side,
    vl_red: i32,
    vl_black: i32,
    distance: i32,
    squares: [u8; 256],
    history: Vec<MoveRecord>,
    zobr: ZobristKey,
}

impl Default for Position {
    fn default() -> Position {
        Position::new()
    }
}

impl Position {
    /// The standard opening array, Red to move.
    pub fn new() -> Position {
        let mut pos = Position::empty();
        pos.startup();
        pos
    }

    fn empty() -> Position {
        Position {
            side: Side::Red,
            vl_red: 0,
            vl_black: 0,
            distance: 0,
            squares: [0; 256],
            history: Vec::with_capacity(MAX_MOVES),
            zobr: ZobristKey::default(),
        }
    }

    /// Resets to the standard opening array. The driver calls this again
    /// after game over.
    pub fn startup(&mut self) {
        self.clear_board();
        for sq in 0..256 {
            let pc = STARTUP_BOARD[sq];
            if pc != 0 {
                self.add_piece(sq, pc);
            }
        }
        self.set_irrev();
    }

    fn clear_board(&mut self) {
        self.side = Side::Red;
        self.vl_red = 0;
        self.vl_black = 0;
        self.distance = 0;
        self.squares = [0; 256];
        self.zobr = ZobristKey::default();
        self.history.clear();
    }

    /// Truncates the history stack to a single base record. Called after an
    /// irreversible ply (a capture) so stale keys cannot alias repetitions.
    pub fn set_irrev(&mut self) {
        let check = self.checked();
        let key = self.zobr.key;
        self.history.clear();
        self.history.push(MoveRecord {
            mv: Move::NONE,
            captured: 0,
            check,
            key,
        });
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn board(&self) -> &[u8; 256] {
        &self.squares
    }

    pub fn zobrist(&self) -> ZobristKey {
        self.zobr
    }

    pub fn distance(&self) -> i32 {
        self.distance
    }

    pub fn reset_distance(&mut self) {
        self.distance = 0;
    }

    /// Plies recorded since the last irreversible point, base record included.
    pub fn move_num(&self) -> usize {
        self.history.len()
    }

    fn change_side(&mut self) {
        self.side = self.side.opponent();
        self.zobr ^= ZOBRIST.player;
    }

    fn add_piece(&mut self, sq: usize, pc: u8) {
        self.squares[sq] = pc;
        if pc < 16 {
            self.vl_red += PIECE_POS_VALUE[(pc - 8) as usize][sq] as i32;
        } else {
            self.vl_black += PIECE_POS_VALUE[(pc - 16) as usize][square_flip(sq)] as i32;
        }
        self.zobr ^= ZOBRIST.table[zobrist_row(pc)][sq];
    }

    fn del_piece(&mut self, sq: usize, pc: u8) {
        self.squares[sq] = 0;
        if pc < 16 {
            self.vl_red -= PIECE_POS_VALUE[(pc - 8) as usize][sq] as i32;
        } else {
            self.vl_black -= PIECE_POS_VALUE[(pc - 16) as usize][square_flip(sq)] as i32;
        }
        self.zobr ^= ZOBRIST.table[zobrist_row(pc)][sq];
    }

    /// Material plus positional balance from the side to move, with a small
    /// tempo bonus.
    pub fn evaluate(&self) -> i32 {
        match self.side {
            Side::Red => self.vl_red - self.vl_black + ADVANCED_VALUE,
            Side::Black => self.vl_black - self.vl_red + ADVANCED_VALUE,
        }
    }

    /// Whether the last recorded ply gave check.
    pub fn in_check(&self) -> bool {
        self.history.last().map(|rec| rec.check).unwrap_or(false)
    }

    /// Whether the last recorded ply captured a piece.
    pub fn captured(&self) -> bool {
        self.history
            .last()
            .map(|rec| rec.captured != 0)
            .unwrap_or(false)
    }

    /// The side to move still has enough material for null-move pruning to
    /// be sound.
    pub fn null_okay(&self) -> bool {
        match self.side {
            Side::Red => self.vl_red > NULL_MARGIN,
            Side::Black => self.vl_black > NULL_MARGIN,
        }
    }

    fn move_piece(&mut self, mv: Move) -> u8 {
        let src = mv.src();
        let dst = mv.dst();
        let captured = self.squares[dst];
        if captured != 0 {
            self.del_piece(dst, captured);
        }
        let pc = self.squares[src];
        self.del_piece(src, pc);
        self.add_piece(dst, pc);
        captured
    }

    fn undo_move_piece(&mut self, mv: Move, captured: u8) {
        let src = mv.src();
        let dst = mv.dst();
        let pc = self.squares[dst];
        self.del_piece(dst, pc);
        self.add_piece(src, pc);
        if captured != 0 {
            self.add_piece(dst, captured);
        }
    }

    /// Plays a move. Returns false and restores the board when the move
    /// would leave the mover's own general attacked.
    pub fn make_move(&mut self, mv: Move) -> bool {
        debug_assert!(self.history.len() < MAX_MOVES);
        let key = self.zobr.key;
        let captured = self.move_piece(mv);
        if self.checked() {
            self.undo_move_piece(mv, captured);
            return false;
        }
        self.change_side();
        let check = self.checked();
        self.history.push(MoveRecord {
            mv,
            captured,
            check,
            key,
        });
        self.distance += 1;
        true
    }

    pub fn undo_make_move(&mut self) {
        self.distance -= 1;
        self.change_side();
        let rec = self.history.pop().expect("unbalanced undo_make_move");
        self.undo_move_piece(rec.mv, rec.captured);
    }

    /// Passes the turn without moving, for null-move pruning.
    pub fn null_move(&mut self) {
        debug_assert!(self.history.len() < MAX_MOVES);
        let key = self.zobr.key;
        self.change_side();
        self.history.push(MoveRecord {
            mv: Move::NONE,
            captured: 0,
            check: false,
            key,
        });
        self.distance += 1;
    }

    pub fn undo_null_move(&mut self) {
        self.distance -= 1;
        self.change_side();
        self.history.pop().expect("unbalanced undo_null_move");
    }

    // ---------------- Move generation ----------------

    /// Every pseudo-legal move for the side to move; moves that leave the
    /// own general attacked are filtered later by `make_move`. With
    /// `captures_only`, only moves onto enemy pieces are produced.
    pub fn generate_moves(&self, captures_only: bool) -> Vec<Move> {
        let mut moves = Vec::with_capacity(MAX_GEN_MOVES);
        let self_tag = self.side.tag();
        let opp_tag = self.side.opp_tag();
        let want = |pc_dst: u8| {
            if captures_only {
                pc_dst & opp_tag != 0
            } else {
                pc_dst & self_tag == 0
            }
        };

        for src in 0..256usize {
            if !in_board(src) {
                continue;
            }
            let pc_src = self.squares[src];
            if pc_src & self_tag == 0 {
                continue;
            }

            match pc_src - self_tag {
                PIECE_JIANG => {
                    for &delta in &JIANG_DELTA {
                        let dst = shifted(src, delta);
                        if in_fort(dst) && want(self.squares[dst]) {
                            moves.push(Move::new(src, dst));
                        }
                    }
                }
                PIECE_SHI => {
                    for &delta in &SHI_DELTA {
                        let dst = shifted(src, delta);
                        if in_fort(dst) && want(self.squares[dst]) {
                            moves.push(Move::new(src, dst));
                        }
                    }
                }
                PIECE_XIANG => {
                    for &delta in &SHI_DELTA {
                        let eye = shifted(src, delta);
                        if !in_board(eye) || !home_half(eye, self.side) || self.squares[eye] != 0
                        {
                            continue;
                        }
                        let dst = shifted(eye, delta);
                        if in_board(dst) && want(self.squares[dst]) {
                            moves.push(Move::new(src, dst));
                        }
                    }
                }
                PIECE_MA => {
                    for i in 0..4 {
                        if self.squares[shifted(src, JIANG_DELTA[i])] != 0 {
                            continue;
                        }
                        for &delta in &MA_DELTA[i] {
                            let dst = shifted(src, delta);
                            if in_board(dst) && want(self.squares[dst]) {
                                moves.push(Move::new(src, dst));
                            }
                        }
                    }
                }
                PIECE_JU => {
                    for &delta in &JIANG_DELTA {
                        let mut dst = shifted(src, delta);
                        while in_board(dst) {
                            let pc_dst = self.squares[dst];
                            if pc_dst == 0 {
                                if !captures_only {
                                    moves.push(Move::new(src, dst));
                                }
                            } else {
                                if pc_dst & opp_tag != 0 {
                                    moves.push(Move::new(src, dst));
                                }
                                break;
                            }
                            dst = shifted(dst, delta);
                        }
                    }
                }
                PIECE_PAO => {
                    for &delta in &JIANG_DELTA {
                        let mut dst = shifted(src, delta);
                        while in_board(dst) {
                            if self.squares[dst] == 0 {
                                if !captures_only {
                                    moves.push(Move::new(src, dst));
                                }
                            } else {
                                break;
                            }
                            dst = shifted(dst, delta);
                        }
                        // Past the screen: the first piece behind it may be taken.
                        dst = shifted(dst, delta);
                        while in_board(dst) {
                            let pc_dst = self.squares[dst];
                            if pc_dst != 0 {
                                if pc_dst & opp_tag != 0 {
                                    moves.push(Move::new(src, dst));
                                }
                                break;
                            }
                            dst = shifted(dst, delta);
                        }
                    }
                }
                PIECE_BING => {
                    let dst = square_forward(src, self.side);
                    if in_board(dst) && want(self.squares[dst]) {
                        moves.push(Move::new(src, dst));
                    }
                    if crossed_river(src, self.side) {
                        for delta in [-1isize, 1] {
                            let dst = shifted(src, delta);
                            if in_board(dst) && want(self.squares[dst]) {
                                moves.push(Move::new(src, dst));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        moves
    }

    /// Standalone geometric validator for a single move, used to vet moves
    /// coming from outside the generator (driver input, book, killers).
    /// Self-check is not examined here; `make_move` rejects that.
    pub fn legal_move(&self, mv: Move) -> bool {
        let src = mv.src();
        let dst = mv.dst();
        if !in_board(dst) {
            return false;
        }
        let pc_src = self.squares[src];
        let self_tag = self.side.tag();
        if pc_src & self_tag == 0 {
            return false;
        }
        let pc_dst = self.squares[dst];
        if pc_dst & self_tag != 0 {
            return false;
        }

        match pc_src - self_tag {
            PIECE_JIANG => in_fort(dst) && jiang_span(src, dst),
            PIECE_SHI => in_fort(dst) && shi_span(src, dst),
            PIECE_XIANG => {
                same_half(src, dst)
                    && xiang_span(src, dst)
                    && self.squares[xiang_eye(src, dst)] == 0
            }
            PIECE_MA => {
                let leg = ma_leg(src, dst);
                leg != src && self.squares[leg] == 0
            }
            piece @ (PIECE_JU | PIECE_PAO) => {
                let delta: isize = if same_rank(src, dst) {
                    if dst < src {
                        -1
                    } else {
                        1
                    }
                } else if same_file(src, dst) {
                    if dst < src {
                        -16
                    } else {
                        16
                    }
                } else {
                    return false;
                };
                let mut sq = shifted(src, delta);
                while sq != dst && self.squares[sq] == 0 {
                    sq = shifted(sq, delta);
                }
                if sq == dst {
                    pc_dst == 0 || piece == PIECE_JU
                } else if pc_dst != 0 && piece == PIECE_PAO {
                    sq = shifted(sq, delta);
                    while sq != dst && self.squares[sq] == 0 {
                        sq = shifted(sq, delta);
                    }
                    sq == dst
                } else {
                    false
                }
            }
            PIECE_BING => {
                if crossed_river(dst, self.side) && (dst == src - 1 || dst == src + 1) {
                    return true;
                }
                dst == square_forward(src, self.side)
            }
            _ => false,
        }
    }

    // ---------------- Check, mate, repetition ----------------

    /// Whether the side to move's general is currently attacked.
    pub fn checked(&self) -> bool {
        let self_tag = self.side.tag();
        let opp_tag = self.side.opp_tag();

        for sq in 0..256usize {
            if !in_board(sq) || self.squares[sq] != self_tag + PIECE_JIANG {
                continue;
            }

            // Enemy soldier ahead of or beside the general.
            if self.squares[square_forward(sq, self.side)] == opp_tag + PIECE_BING {
                return true;
            }
            for delta in [-1isize, 1] {
                if self.squares[shifted(sq, delta)] == opp_tag + PIECE_BING {
                    return true;
                }
            }

            // Enemy horse, with the diagonal step as its leg.
            for i in 0..4 {
                if self.squares[shifted(sq, SHI_DELTA[i])] != 0 {
                    continue;
                }
                for &delta in &MA_CHECK_DELTA[i] {
                    if self.squares[shifted(sq, delta)] == opp_tag + PIECE_MA {
                        return true;
                    }
                }
            }

            // Enemy rook or facing general on the open ray, enemy cannon
            // behind the first blocker.
            for &delta in &JIANG_DELTA {
                let mut dst = shifted(sq, delta);
                while in_board(dst) {
                    let pc = self.squares[dst];
                    if pc != 0 {
                        if pc == opp_tag + PIECE_JU || pc == opp_tag + PIECE_JIANG {
                            return true;
                        }
                        break;
                    }
                    dst = shifted(dst, delta);
                }
                dst = shifted(dst, delta);
                while in_board(dst) {
                    let pc = self.squares[dst];
                    if pc != 0 {
                        if pc == opp_tag + PIECE_PAO {
                            return true;
                        }
                        break;
                    }
                    dst = shifted(dst, delta);
                }
            }
            return false;
        }
        false
    }

    /// True when no pseudo-legal move survives the self-check filter.
    pub fn is_mate(&mut self) -> bool {
        for mv in self.generate_moves(false) {
            let captured = self.move_piece(mv);
            let checked = self.checked();
            self.undo_move_piece(mv, captured);
            if !checked {
                return false;
            }
        }
        true
    }

    fn draw_value(&self) -> i32 {
        if self.distance & 1 == 0 {
            -DRAW_VALUE
        } else {
            DRAW_VALUE
        }
    }

    /// Walks the history stack for repeated keys. Returns 0 when no
    /// repetition occurred within `recur` recurrences, otherwise a mask:
    /// bit 0 repetition, bit 1 the side to move checked on every own ply of
    /// the cycle, bit 2 the same for the opponent. The scan stops at the
    /// first capture or null record.
    pub fn rep_status(&self, mut recur: i32) -> i32 {
        let mut self_side = false;
        let mut self_perp_check = true;
        let mut opp_perp_check = true;

        for rec in self.history.iter().rev() {
            if rec.mv.is_none() || rec.captured != 0 {
                break;
            }
            if self_side {
                self_perp_check = self_perp_check && rec.check;
                if rec.key == self.zobr.key {
                    recur -= 1;
                    if recur == 0 {
                        let mut mask = 1;
                        if self_perp_check {
                            mask += 2;
                        }
                        if opp_perp_check {
                            mask += 4;
                        }
                        return mask;
                    }
                }
            } else {
                opp_perp_check = opp_perp_check && rec.check;
            }
            self_side = !self_side;
        }
        0
    }

    /// Converts a `rep_status` mask into a score. A side that forced the
    /// repetition by perpetual check loses; a plain repetition scores as a
    /// faintly undesirable draw.
    pub fn rep_value(&self, mask: i32) -> i32 {
        let mut value = 0;
        if mask & 2 != 0 {
            value += self.distance - BAN_VALUE;
        }
        if mask & 4 != 0 {
            value += BAN_VALUE - self.distance;
        }
        if value == 0 {
            self.draw_value()
        } else {
            value
        }
    }

    /// Capture-ordering weight: most valuable victim, least valuable attacker.
    pub fn mvv_lva(&self, mv: Move) -> i32 {
        (MVV_VALUE[self.squares[mv.dst()] as usize] << 3)
            - MVV_VALUE[self.squares[mv.src()] as usize]
    }

    /// The horizontally mirrored position, used for book lookups.
    pub fn mirrored(&self) -> Position {
        let mut mirror = Position::empty();
        for sq in 0..256 {
            let pc = self.squares[sq];
            if pc != 0 {
                mirror.add_piece(mirror_square(sq), pc);
            }
        }
        if self.side == Side::Black {
            mirror.change_side();
        }
        mirror.set_irrev();
        mirror
    }

    // ---------------- Notation ----------------

    pub fn from_fen(fen: &str) -> Result<Position, EngineError> {
        let bad = || EngineError::InvalidFen(fen.to_string());
        let mut parts = fen.split_whitespace();
        let ranks = parts.next().ok_or_else(bad)?;

        let mut pos = Position::empty();
        let mut rank = RANK_TOP;
        let mut file = FILE_LEFT;
        for ch in ranks.chars() {
            match ch {
                '/' => {
                    rank += 1;
                    file = FILE_LEFT;
                    if rank > RANK_BOTTOM {
                        return Err(bad());
                    }
                }
                '1'..='9' => file += ch as usize - '0' as usize,
                _ => {
                    let pc = piece_from_char(ch).ok_or_else(bad)?;
                    if file > FILE_RIGHT {
                        return Err(bad());
                    }
                    pos.add_piece(make_square(file, rank), pc);
                    file += 1;
                }
            }
        }
        if let Some(side) = parts.next() {
            match side {
                "w" | "r" => {}
                "b" => pos.change_side(),
                _ => return Err(bad()),
            }
        }
        pos.set_irrev();
        Ok(pos)
    }

    pub fn to_fen(&self) -> String {
        let mut out = String::new();
        for rank in RANK_TOP..=RANK_BOTTOM {
            let mut gap = 0;
            for file in FILE_LEFT..=FILE_RIGHT {
                let pc = self.squares[make_square(file, rank)];
                if pc == 0 {
                    gap += 1;
                } else {
                    if gap > 0 {
                        out.push((b'0' + gap) as char);
                        gap = 0;
                    }
                    out.push(piece_char(pc));
                }
            }
            if gap > 0 {
                out.push((b'0' + gap) as char);
            }
            if rank < RANK_BOTTOM {
                out.push('/');
            }
        }
        out.push(' ');
        out.push(match self.side {
            Side::Red => 'w',
            Side::Black => 'b',
        });
        out
    }

    /// A plain text rendering of the board for terminal drivers and logs.
    pub fn board_string(&self) -> String {
        let mut out = String::new();
        for rank in RANK_TOP..=RANK_BOTTOM {
            out.push((b'0' + (RANK_BOTTOM - rank) as u8) as char);
            for file in FILE_LEFT..=FILE_RIGHT {
                out.push(' ');
                out.push(piece_char(self.squares[make_square(file, rank)]));
            }
            out.push('\n');
        }
        out.push_str("  a b c d e f g h i\n");
        out
    }
}

// ---------------- Piece tables ----------------

pub const MVV_VALUE: [i32; 24] = [
    0, 0, 0, 0, 0, 0, 0, 0, 5, 1, 1, 3, 4, 3, 2, 0, 5, 1, 1, 3, 4, 3, 2, 0,
];

#[rustfmt::skip]
pub const STARTUP_BOARD: [u8; 256] = [
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0, 20, 19, 18, 17, 16, 17, 18, 19, 20,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0, 21,  0,  0,  0,  0,  0, 21,  0,  0,  0,  0,  0,
    0,  0,  0, 22,  0, 22,  0, 22,  0, 22,  0, 22,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0, 14,  0, 14,  0, 14,  0, 14,  0, 14,  0,  0,  0,  0,
    0,  0,  0,  0, 13,  0,  0,  0,  0,  0, 13,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0, 12, 11, 10,  9,  8,  9, 10, 11, 12,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
];

// Positional value per square, oriented for Red; Black flips the square.
#[rustfmt::skip]
pub const PIECE_POS_VALUE: [[u8; 256]; 7] = [
    [ // Jiang
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  1,  1,  1,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  2,  2,  2,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0, 11, 15, 11,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Shi
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0, 20,  0, 20,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0, 23,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0, 20,  0, 20,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Xiang
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0, 20,  0,  0,  0, 20,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0, 18,  0,  0,  0, 23,  0,  0,  0, 18,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0, 20,  0,  0,  0, 20,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Ma
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0, 90, 90, 90, 96, 90, 96, 90, 90, 90,  0,  0,  0,  0,
    0,  0,  0, 90, 96,103, 97, 94, 97,103, 96, 90,  0,  0,  0,  0,
    0,  0,  0, 92, 98, 99,103, 99,103, 99, 98, 92,  0,  0,  0,  0,
    0,  0,  0, 93,108,100,107,100,107,100,108, 93,  0,  0,  0,  0,
    0,  0,  0, 90,100, 99,103,104,103, 99,100, 90,  0,  0,  0,  0,
    0,  0,  0, 90, 98,101,102,103,102,101, 98, 90,  0,  0,  0,  0,
    0,  0,  0, 92, 94, 98, 95, 98, 95, 98, 94, 92,  0,  0,  0,  0,
    0,  0,  0, 93, 92, 94, 95, 92, 95, 94, 92, 93,  0,  0,  0,  0,
    0,  0,  0, 85, 90, 92, 93, 78, 93, 92, 90, 85,  0,  0,  0,  0,
    0,  0,  0, 88, 85, 90, 88, 90, 88, 90, 85, 88,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Ju
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,206,208,207,213,214,213,207,208,206,  0,  0,  0,  0,
    0,  0,  0,206,212,209,216,233,216,209,212,206,  0,  0,  0,  0,
    0,  0,  0,206,208,207,214,216,214,207,208,206,  0,  0,  0,  0,
    0,  0,  0,206,213,213,216,216,216,213,213,206,  0,  0,  0,  0,
    0,  0,  0,208,211,211,214,215,214,211,211,208,  0,  0,  0,  0,
    0,  0,  0,208,212,212,214,215,214,212,212,208,  0,  0,  0,  0,
    0,  0,  0,204,209,204,212,214,212,204,209,204,  0,  0,  0,  0,
    0,  0,  0,198,208,204,212,212,212,204,208,198,  0,  0,  0,  0,
    0,  0,  0,200,208,206,212,200,212,206,208,200,  0,  0,  0,  0,
    0,  0,  0,194,206,204,212,200,212,204,206,194,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Pao
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,100,100, 96, 91, 90, 91, 96,100,100,  0,  0,  0,  0,
    0,  0,  0, 98, 98, 96, 92, 89, 92, 96, 98, 98,  0,  0,  0,  0,
    0,  0,  0, 97, 97, 96, 91, 92, 91, 96, 97, 97,  0,  0,  0,  0,
    0,  0,  0, 96, 99, 99, 98,100, 98, 99, 99, 96,  0,  0,  0,  0,
    0,  0,  0, 96, 96, 96, 96,100, 96, 96, 96, 96,  0,  0,  0,  0,
    0,  0,  0, 95, 96, 99, 96,100, 96, 99, 96, 95,  0,  0,  0,  0,
    0,  0,  0, 96, 96, 96, 96, 96, 96, 96, 96, 96,  0,  0,  0,  0,
    0,  0,  0, 97, 96,100, 99,101, 99,100, 96, 97,  0,  0,  0,  0,
    0,  0,  0, 96, 97, 98, 98, 98, 98, 98, 97, 96,  0,  0,  0,  0,
    0,  0,  0, 96, 96, 97, 99, 99, 99, 97, 96, 96,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
    [ // Bing
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  9,  9,  9, 11, 13, 11,  9,  9,  9,  0,  0,  0,  0,
    0,  0,  0, 19, 24, 34, 42, 44, 42, 34, 24, 19,  0,  0,  0,  0,
    0,  0,  0, 19, 24, 32, 37, 37, 37, 32, 24, 19,  0,  0,  0,  0,
    0,  0,  0, 19, 23, 27, 29, 30, 29, 27, 23, 19,  0,  0,  0,  0,
    0,  0,  0, 14, 18, 20, 27, 29, 27, 20, 18, 14,  0,  0,  0,  0,
    0,  0,  0,  7,  0, 13,  0, 16,  0, 13,  0,  7,  0,  0,  0,  0,
    0,  0,  0,  7,  0,  7,  0, 15,  0,  7,  0,  7,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
    ],
];

// ---------------- Tests ----------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn pos(fen: &str) -> Position {
        Position::from_fen(fen).unwrap()
    }

    fn rehash(p: &Position) -> ZobristKey {
        let mut z = ZobristKey::default();
        for sq in 0..256 {
            let pc = p.board()[sq];
            if pc != 0 {
                z ^= ZOBRIST.table[zobrist_row(pc)][sq];
            }
        }
        if p.side() == Side::Black {
            z ^= ZOBRIST.player;
        }
        z
    }

    fn resum_material(p: &Position) -> (i32, i32) {
        let mut red = 0;
        let mut black = 0;
        for sq in 0..256 {
            let pc = p.board()[sq];
            if pc == 0 {
                continue;
            }
            if pc < 16 {
                red += PIECE_POS_VALUE[(pc - 8) as usize][sq] as i32;
            } else {
                black += PIECE_POS_VALUE[(pc - 16) as usize][square_flip(sq)] as i32;
            }
        }
        (red, black)
    }

    fn legal_replies(p: &mut Position) -> Vec<Move> {
        let mut out = Vec::new();
        for mv in p.generate_moves(false) {
            if p.make_move(mv) {
                p.undo_make_move();
                out.push(mv);
            }
        }
        out
    }

    #[test]
    fn geometry_predicates() {
        let on_board = (0..256).filter(|&sq| in_board(sq)).count();
        assert_eq!(on_board, 90);
        let in_forts = (0..256).filter(|&sq| in_fort(sq)).count();
        assert_eq!(in_forts, 18);
        for sq in 0..256 {
            assert_eq!(square_flip(square_flip(sq)), sq);
            assert_eq!(mirror_square(mirror_square(sq)), sq);
            if in_board(sq) {
                assert!(in_board(square_flip(sq)));
                assert!(in_board(mirror_square(sq)));
            }
        }
    }

    #[test]
    fn coords_round_trip() {
        for sq in (0..256).filter(|&sq| in_board(sq)) {
            let token = square_to_coords(sq);
            assert_eq!(square_from_coords(&token).unwrap(), sq);
        }
        assert_eq!(square_from_coords("a0").unwrap(), make_square(3, 12));
        assert_eq!(square_from_coords("i9").unwrap(), make_square(11, 3));
        assert!(square_from_coords("j3").is_err());
        assert!(Move::from_coords("h2e2").is_ok());
        assert!(Move::from_coords("h2e").is_err());
    }

    #[test]
    fn startup_state_is_consistent() {
        let p = Position::new();
        let pieces = p.board().iter().filter(|&&pc| pc != 0).count();
        assert_eq!(pieces, 32);
        assert_eq!(p.side(), Side::Red);
        assert_eq!(p.zobrist(), rehash(&p));
        assert_eq!(resum_material(&p), (p.vl_red, p.vl_black));
        assert!(!p.checked());
        assert!(!p.in_check());
    }

    #[test]
    fn fen_round_trip() {
        let p = Position::new();
        assert_eq!(
            p.to_fen(),
            "rnbakabnr/9/1c5c1/p1p1p1p1p/9/9/P1P1P1P1P/1C5C1/9/RNBAKABNR w"
        );
        let q = pos(&p.to_fen());
        assert_eq!(p.board(), q.board());
        assert_eq!(p.zobrist(), q.zobrist());

        let asym = pos("4k4/9/9/9/9/9/9/4C4/9/3K5 b");
        assert_eq!(pos(&asym.to_fen()).zobrist(), asym.zobrist());
    }

    #[test]
    fn initial_position_has_44_moves() {
        let mut p = Position::new();
        let pseudo = p.generate_moves(false);
        assert_eq!(pseudo.len(), 44);
        assert_eq!(legal_replies(&mut p).len(), 44);
        // Stable across repeated generation.
        assert_eq!(p.generate_moves(false), pseudo);
    }

    #[test]
    fn generated_moves_pass_the_validator() {
        let mut p = Position::new();
        for token in ["b2e2", "h9g7", "h0g2", "b9c7"] {
            for gen in p.generate_moves(false) {
                assert!(p.legal_move(gen), "generated move {gen} failed validation");
            }
            let opp = p.side().opp_tag();
            for cap in p.generate_moves(true) {
                assert!(p.legal_move(cap));
                assert!(p.board()[cap.dst()] & opp != 0);
            }
            let mv = Move::from_coords(token).unwrap();
            assert!(p.legal_move(mv));
            assert!(p.make_move(mv));
        }
    }

    #[test]
    fn random_walk_keeps_incremental_state_consistent() {
        let mut rng = StdRng::seed_from_u64(20200202);
        let mut p = Position::new();
        for _ in 0..120 {
            let moves = legal_replies(&mut p);
            if moves.is_empty() || p.move_num() >= MAX_MOVES - 1 {
                break;
            }
            let mv = moves[rng.gen_range(0..moves.len())];

            let before = p.clone();
            assert!(p.make_move(mv));
            p.undo_make_move();
            assert_eq!(p, before, "make/undo did not restore the position");

            assert!(p.make_move(mv));
            assert_eq!(p.zobrist(), rehash(&p));
            assert_eq!(resum_material(&p), (p.vl_red, p.vl_black));

            // The mover may never end its own ply in check.
            let mut mover_view = p.clone();
            mover_view.change_side();
            assert!(!mover_view.checked());
        }
    }

    #[test]
    fn null_move_round_trips() {
        let mut p = Position::new();
        let before = p.clone();
        p.null_move();
        assert_eq!(p.side(), Side::Black);
        p.undo_null_move();
        assert_eq!(p, before);
    }

    #[test]
    fn flying_general_is_check() {
        // Both generals on the open center file.
        let p = pos("4k4/9/9/9/9/9/9/9/9/4K4 w");
        assert!(p.checked());
        let q = pos("4k4/9/9/9/9/9/9/9/9/4K4 b");
        assert!(q.checked());
        // A screen between them ends the attack.
        let r = pos("4k4/9/9/9/4p4/9/9/9/9/4K4 w");
        assert!(!r.checked());
    }

    #[test]
    fn horse_leg_blocks_forward_jumps() {
        // Red horse on b2 behind its own soldier on b3.
        let blocked = pos("4k4/9/9/9/9/9/1P7/1N7/9/3K5 w");
        let ma_sq = square_from_coords("b2").unwrap();
        let jumps = |p: &Position| {
            p.generate_moves(false)
                .into_iter()
                .filter(|mv| mv.src() == ma_sq)
                .count()
        };
        assert_eq!(jumps(&blocked), 4);
        for dst in ["a4", "c4"] {
            let mv = Move::new(ma_sq, square_from_coords(dst).unwrap());
            assert!(!blocked.legal_move(mv));
        }

        let open = pos("4k4/9/9/9/9/9/9/1N7/9/3K5 w");
        assert_eq!(jumps(&open), 6);
        for dst in ["a4", "c4"] {
            let mv = Move::new(ma_sq, square_from_coords(dst).unwrap());
            assert!(open.legal_move(mv));
        }
    }

    #[test]
    fn cannon_needs_exactly_one_screen() {
        let shot = Move::from_coords("e2e6").unwrap();
        // One screen on e4: the capture is on.
        let one = pos("4k4/9/9/4r4/9/4P4/9/4C4/9/3K5 w");
        assert!(one.legal_move(shot));
        // No screen: cannons cannot capture like rooks.
        let none = pos("4k4/9/9/4r4/9/9/9/4C4/9/3K5 w");
        assert!(!none.legal_move(shot));
        // Two screens: the shot is blocked again.
        let two = pos("4k4/9/9/4r4/4p4/4P4/9/4C4/9/3K5 w");
        assert!(!two.legal_move(shot));
        // Sliding onto an empty square still needs a clear path.
        assert!(none.legal_move(Move::from_coords("e2e5").unwrap()));
        assert!(!one.legal_move(Move::from_coords("e2e5").unwrap()));
    }

    #[test]
    fn soldier_gains_sideways_steps_after_the_river() {
        let over = pos("4k4/9/9/9/4P4/9/9/9/9/4K4 w");
        let sq = square_from_coords("e5").unwrap();
        let count = over
            .generate_moves(false)
            .into_iter()
            .filter(|mv| mv.src() == sq)
            .count();
        assert_eq!(count, 3);

        let home = pos("4k4/9/9/9/9/4P4/9/9/9/4K4 w");
        let sq = square_from_coords("e4").unwrap();
        let count = home
            .generate_moves(false)
            .into_iter()
            .filter(|mv| mv.src() == sq)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn make_move_rejects_self_check() {
        // The red horse on e1 screens a black rook aimed down the center file.
        let fen = "4k4/9/9/9/4r4/9/9/9/4N4/4K4 w";
        let mut pinned = pos(fen);
        let mv = Move::from_coords("e1c2").unwrap();
        assert!(pinned.legal_move(mv));
        assert!(!pinned.make_move(mv));
        assert_eq!(pinned, pos(fen));
    }

    #[test]
    fn mate_is_detected() {
        // Back-rank mate: one rook checks along rank 9, the other seals rank 8.
        let mut mated = pos("R3k4/R8/9/9/9/9/9/9/9/3K5 b");
        assert!(mated.checked());
        assert!(mated.is_mate());

        let mut open = pos("R3k4/9/9/9/9/9/9/9/9/3K5 b");
        assert!(!open.is_mate());
    }

    #[test]
    fn perpetual_check_loses() {
        // A red rook shuttles between checking ranks while the black
        // general steps up and down inside its palace.
        let mut p = pos("9/4k4/R8/9/9/9/9/9/9/3K5 w");
        for (red, black) in [("a7a8", "e8e9"), ("a8a9", "e9e8"), ("a9a8", "e8e9")] {
            assert!(p.make_move(Move::from_coords(red).unwrap()));
            assert!(p.in_check(), "red ply {red} should give check");
            assert!(p.make_move(Move::from_coords(black).unwrap()));
        }

        let mask = p.rep_status(1);
        assert_eq!(mask & 1, 1, "repetition not detected");
        assert_eq!(mask & 2, 2, "the checking side was not flagged");
        assert_eq!(mask & 4, 0);
        assert_eq!(p.rep_value(mask), p.distance() - BAN_VALUE);
        assert!(p.rep_value(mask) < -WIN_VALUE);
    }

    #[test]
    fn plain_repetition_scores_as_draw() {
        // Both sides shuffle horses with no checks anywhere.
        let mut p = pos("1n2k4/9/9/9/9/9/9/9/9/1N1K5 w");
        for token in [
            "b0c2", "b9c7", "c2b0", "c7b9", "b0c2", "b9c7", "c2b0", "c7b9",
        ] {
            assert!(p.make_move(Move::from_coords(token).unwrap()));
            assert!(!p.in_check());
        }
        let mask = p.rep_status(1);
        assert_eq!(mask & 1, 1);
        assert_eq!(mask & 2, 0);
        assert_eq!(mask & 4, 0);
        assert_eq!(p.rep_value(mask).abs(), DRAW_VALUE);
    }

    #[test]
    fn capture_ends_the_repetition_scan() {
        let mut p = pos("1n2k4/9/9/9/9/9/9/9/9/1N1K5 w");
        for token in ["b0c2", "b9c7", "c2b0", "c7b9"] {
            assert!(p.make_move(Move::from_coords(token).unwrap()));
        }
        assert_ne!(p.rep_status(1), 0);
        p.set_irrev();
        assert_eq!(p.rep_status(1), 0);
    }

    #[test]
    fn mirror_is_an_involution() {
        let asym = pos("4k4/9/2c6/9/9/9/9/1C7/9/3K5 b");
        let twice = asym.mirrored().mirrored();
        assert_eq!(twice.board(), asym.board());
        assert_eq!(twice.side(), asym.side());
        assert_eq!(twice.zobrist(), asym.zobrist());

        // The mirror itself hashes differently for an asymmetric board.
        assert_ne!(asym.mirrored().zobrist(), asym.zobrist());
    }

    #[test]
    fn mvv_lva_prefers_big_victims_and_small_attackers() {
        let p = pos("4k4/9/9/4r4/9/4P4/9/4C4/9/3K5 w");
        let pawn_advance = Move::from_coords("e4e5").unwrap();
        let cannon_takes_rook = Move::from_coords("e2e6").unwrap();
        assert!(p.mvv_lva(cannon_takes_rook) > 0);
        assert!(p.mvv_lva(cannon_takes_rook) > p.mvv_lva(pawn_advance));
    }
}
