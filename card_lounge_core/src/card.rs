use rand::prelude::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// --- 核心数据结构定义 ---

/// 花色 (Suit)
/// 顺序即比较大小的顺序：方块 < 梅花 < 红心 < 黑桃
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum Suit {
    Diamond, // 方块 ♦️
    Club,    // 梅花 ♣️
    Heart,   // 红心 ♥️
    Spade,   // 黑桃 ♠️
}

/// 点数 (Rank)
/// Ord 的派生让 Ace 是最大的
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub enum Rank {
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
    Ace,
}

/// 单张扑克牌 (Card)
/// 在线上以两个字符表示：点数 + 花色，例如 `"TS"` 是黑桃 10
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid card notation {0:?}")]
pub struct ParseCardError(pub String);

pub const SUITS: [Suit; 4] = [Suit::Diamond, Suit::Club, Suit::Heart, Suit::Spade];

pub const RANKS: [Rank; 13] = [
    Rank::Two, Rank::Three, Rank::Four, Rank::Five, Rank::Six, Rank::Seven,
    Rank::Eight, Rank::Nine, Rank::Ten, Rank::Jack, Rank::Queen, Rank::King, Rank::Ace,
];

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Card {
        Card { rank, suit }
    }
}

impl Suit {
    fn symbol(self) -> char {
        match self {
            Suit::Diamond => 'D',
            Suit::Club => 'C',
            Suit::Heart => 'H',
            Suit::Spade => 'S',
        }
    }

    fn from_symbol(c: char) -> Option<Suit> {
        SUITS.into_iter().find(|s| s.symbol() == c)
    }
}

impl Rank {
    fn symbol(self) -> char {
        match self {
            Rank::Two => '2',
            Rank::Three => '3',
            Rank::Four => '4',
            Rank::Five => '5',
            Rank::Six => '6',
            Rank::Seven => '7',
            Rank::Eight => '8',
            Rank::Nine => '9',
            Rank::Ten => 'T',
            Rank::Jack => 'J',
            Rank::Queen => 'Q',
            Rank::King => 'K',
            Rank::Ace => 'A',
        }
    }

    fn from_symbol(c: char) -> Option<Rank> {
        RANKS.into_iter().find(|r| r.symbol() == c)
    }
}

// --- 实现辅助功能 ---

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.rank.symbol(), self.suit.symbol())
    }
}

impl FromStr for Card {
    type Err = ParseCardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let parsed = match (chars.next(), chars.next(), chars.next()) {
            (Some(r), Some(u), None) => Rank::from_symbol(r).zip(Suit::from_symbol(u)),
            _ => None,
        };
        parsed
            .map(|(rank, suit)| Card { rank, suit })
            .ok_or_else(|| ParseCardError(s.to_string()))
    }
}

impl From<Card> for String {
    fn from(card: Card) -> Self {
        card.to_string()
    }
}

impl TryFrom<String> for Card {
    type Error = ParseCardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// --- 牌堆 ---

/// 一副牌。发牌从牌堆顶部（末尾）取。
#[derive(Debug, Clone, Default)]
pub struct CardPile {
    cards: Vec<Card>,
}

impl CardPile {
    /// 创建一副完整的 52 张扑克牌（未洗牌）
    pub fn standard() -> CardPile {
        let mut cards = Vec::with_capacity(52);
        for &suit in &SUITS {
            for &rank in &RANKS {
                cards.push(Card { rank, suit });
            }
        }
        CardPile { cards }
    }

    /// 创建并洗好一副新牌
    pub fn shuffled() -> CardPile {
        let mut pile = CardPile::standard();
        pile.shuffle();
        pile
    }

    pub fn shuffle(&mut self) {
        let mut rng = rand::rng();
        self.cards.shuffle(&mut rng);
    }

    pub fn draw(&mut self) -> Option<Card> {
        self.cards.pop()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

// --- 单元测试 ---
