use std::collections::{BTreeSet, HashMap};

use crate::models::Color;

/// Curated high-contrast palette. Neighbouring slots are deliberately far
/// apart in hue so adjacent hash values do not look alike.
const PALETTE: [&str; 30] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4",
    "#42d4f4", "#f032e6", "#bfef45", "#469990", "#9a6324",
    "#800000", "#000075", "#ffe119", "#dcbeff", "#aaffc3",
    "#808000", "#ffd8b1", "#fabed4", "#1f77b4", "#d62728",
    "#2ca02c", "#ff7f0e", "#9467bd", "#17becf", "#8c564b",
    "#e377c2", "#bcbd22", "#ff4500", "#00ced1", "#6a5acd",
];

const PALETTE_PRIME: u32 = 2_654_435_761;

/// Stable 31-multiplier string hash
fn primary_hash(s: &str) -> u32 {
    s.chars()
        .fold(0u32, |h, c| h.wrapping_mul(31).wrapping_add(c as u32))
}

/// FNV-1a, independent of `primary_hash`
fn secondary_hash(s: &str, salt: u32) -> u32 {
    let mut h: u32 = 0x811c_9dc5 ^ salt.wrapping_mul(0x9e37_79b9);
    for byte in s.as_bytes() {
        h ^= *byte as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

fn palette_index(user_id: &str) -> usize {
    (primary_hash(user_id).wrapping_mul(PALETTE_PRIME) % PALETTE.len() as u32) as usize
}

fn palette_color(user_id: &str) -> Color {
    Color::from_hex(PALETTE[palette_index(user_id)])
}

/// HSL fallback: hue over the full circle, saturation 70-95%, lightness 45-65%
fn fallback_color(user_id: &str, salt: u32) -> Color {
    let h = secondary_hash(user_id, salt);
    let hue = (h % 360) as f64;
    let saturation = (70 + (h >> 9) % 26) as f64 / 100.0;
    let lightness = (45 + (h >> 17) % 21) as f64 / 100.0;
    hsl_to_color(hue, saturation, lightness)
}

fn hsl_to_color(hue: f64, saturation: f64, lightness: f64) -> Color {
    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue / 60.0;
    let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());
    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };
    let m = lightness - chroma / 2.0;
    let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
    Color::from_rgb(channel(r), channel(g), channel(b))
}

/// Maps user ids to display colors without any coordination between clients.
///
/// A user gets their palette slot unless another online user with a smaller id
/// hashes to the same slot. Slot losers are then walked in id order and each
/// takes the first salted HSL color not already held by a palette winner or an
/// earlier loser. The result depends only on the user id and the online set, so
/// every replica with the same online set agrees and no two online users share
/// a color.
#[derive(Debug, Default)]
pub struct ColorAssigner {
    online: BTreeSet<String>,
    cache: HashMap<String, Color>,
}

impl ColorAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the online set. Cached colors are recomputed against the new set;
    /// users who went offline free their palette slot.
    pub fn set_online<I, S>(&mut self, users: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let online: BTreeSet<String> = users.into_iter().map(Into::into).collect();
        if online != self.online {
            self.online = online;
            self.cache.clear();
        }
    }

    pub fn evict(&mut self, user_id: &str) {
        if self.online.remove(user_id) {
            self.cache.clear();
        } else {
            self.cache.remove(user_id);
        }
    }

    pub fn color_for(&mut self, user_id: &str) -> Color {
        if self.cache.is_empty() && !self.online.is_empty() {
            self.cache = assign(&self.online);
        }
        if let Some(color) = self.cache.get(user_id) {
            return color.clone();
        }

        // Not online: color them as if they had just joined
        let mut with_user = self.online.clone();
        with_user.insert(user_id.to_string());
        let color = assign(&with_user)
            .remove(user_id)
            .unwrap_or_else(|| palette_color(user_id));
        self.cache.insert(user_id.to_string(), color.clone());
        color
    }
}

/// Colors for a whole online set
fn assign(online: &BTreeSet<String>) -> HashMap<String, Color> {
    let mut colors = HashMap::with_capacity(online.len());
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut claimed = [false; PALETTE.len()];
    let mut losers = Vec::new();

    // BTreeSet iterates in id order, so the smallest id claims each slot
    for user_id in online {
        let slot = palette_index(user_id);
        if claimed[slot] {
            losers.push(user_id);
            continue;
        }
        claimed[slot] = true;
        taken.insert(PALETTE[slot].to_string());
        colors.insert(user_id.clone(), Color::from_hex(PALETTE[slot]));
    }

    for user_id in losers {
        let color = (0..u32::MAX)
            .map(|salt| fallback_color(user_id, salt))
            .find(|color| !taken.contains(color.as_str()))
            .unwrap_or_else(|| fallback_color(user_id, 0));
        taken.insert(color.as_str().to_string());
        colors.insert(user_id.clone(), color);
    }
    colors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn colliding_pair() -> (String, String) {
        let mut seen: HashMap<usize, String> = HashMap::new();
        for i in 0..1_000 {
            let id = format!("user-{i}");
            let slot = palette_index(&id);
            if let Some(previous) = seen.get(&slot) {
                return (previous.clone(), id);
            }
            seen.insert(slot, id);
        }
        unreachable!("30 slots cannot hold 1000 distinct ids");
    }

    #[test]
    fn deterministic_across_assigners() {
        let online = ["alice", "bob", "carol", "dave"];
        let mut first = ColorAssigner::new();
        let mut second = ColorAssigner::new();
        first.set_online(online);
        second.set_online(online.iter().rev().copied());

        for user in online {
            let color = first.color_for(user);
            assert_eq!(color, first.color_for(user));
            assert_eq!(color, second.color_for(user));
        }
    }

    #[test]
    fn collision_falls_back_to_generated_color() {
        let (a, b) = colliding_pair();
        let (winner, loser) = if a < b { (a, b) } else { (b, a) };

        let mut colors = ColorAssigner::new();
        colors.set_online([winner.clone(), loser.clone()]);
        let winner_color = colors.color_for(&winner);
        let loser_color = colors.color_for(&loser);

        assert_eq!(winner_color, palette_color(&winner));
        assert_ne!(winner_color, loser_color);
        assert_eq!(loser_color, colors.color_for(&loser));
    }

    #[test]
    fn offline_users_release_their_slot() {
        let (a, b) = colliding_pair();
        let (winner, loser) = if a < b { (a, b) } else { (b, a) };

        let mut colors = ColorAssigner::new();
        colors.set_online([winner.clone(), loser.clone()]);
        assert_ne!(colors.color_for(&loser), palette_color(&loser));

        colors.evict(&winner);
        assert_eq!(colors.color_for(&loser), palette_color(&loser));
    }

    #[test]
    fn fallback_stays_in_tuned_ranges() {
        for i in 0..200 {
            let h = secondary_hash(&format!("user-{i}"), 0);
            let saturation = 70 + (h >> 9) % 26;
            let lightness = 45 + (h >> 17) % 21;
            assert!((70..=95).contains(&saturation));
            assert!((45..=65).contains(&lightness));
        }
        assert_eq!(hsl_to_color(0.0, 1.0, 0.5).as_str(), "#ff0000");
        assert_eq!(hsl_to_color(120.0, 1.0, 0.5).as_str(), "#00ff00");
        assert_eq!(hsl_to_color(240.0, 1.0, 0.5).as_str(), "#0000ff");
    }

    /// Ids sharing one palette slot, smallest first
    fn same_slot(count: usize) -> Vec<String> {
        let mut by_slot: HashMap<usize, Vec<String>> = HashMap::new();
        for i in 0..10_000 {
            let id = format!("user-{i}");
            let ids = by_slot.entry(palette_index(&id)).or_default();
            ids.push(id);
            if ids.len() == count {
                let mut ids = ids.clone();
                ids.sort();
                return ids;
            }
        }
        unreachable!("30 slots cannot spread 10000 ids that thin");
    }

    fn assert_distinct(colors: &mut ColorAssigner, users: &[String]) {
        let assigned: BTreeSet<String> = users
            .iter()
            .map(|user| colors.color_for(user).as_str().to_string())
            .collect();
        assert_eq!(assigned.len(), users.len(), "two online users share a color");
    }

    #[test]
    fn slot_losers_never_share_a_fallback() {
        let users: Vec<String> = ["user-100044", "user-102291", "user-106611"]
            .iter()
            .map(|u| u.to_string())
            .collect();
        let mut colors = ColorAssigner::new();
        colors.set_online(users.iter().cloned());
        assert_distinct(&mut colors, &users);
    }

    #[test]
    fn crowded_slot_gets_distinct_colors() {
        let users = same_slot(5);
        let mut first = ColorAssigner::new();
        first.set_online(users.iter().cloned());
        assert_distinct(&mut first, &users);

        // Same answer regardless of the order users were seen in
        let mut second = ColorAssigner::new();
        second.set_online(users.iter().rev().cloned());
        for user in &users {
            assert_eq!(first.color_for(user), second.color_for(user));
        }
    }
}
