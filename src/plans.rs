use serde::{Deserialize, Serialize};

/// Subscription tiers, ordered from most to least restricted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Guest,
    Free,
    Pro,
    Business,
    Admin,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Guest => "guest",
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Business => "business",
            Tier::Admin => "admin",
        }
    }
}

/// Resolves a stored subscription tier string. Unknown or empty values map
/// to the free tier; `guest` is reserved for anonymous callers and is never
/// stored on a user row.
pub fn resolve_tier(stored: Option<&str>) -> Tier {
    match stored.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "pro" => Tier::Pro,
        "business" => Tier::Business,
        "admin" => Tier::Admin,
        _ => Tier::Free,
    }
}

/// Metered operations. Upscales above 2x bill against the 4x budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Resize,
    Upscale2x,
    Upscale4x,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Resize => "resize",
            Operation::Upscale2x => "upscale_2x",
            Operation::Upscale4x => "upscale_4x",
        }
    }

    pub const ALL: [Operation; 3] =
        [Operation::Resize, Operation::Upscale2x, Operation::Upscale4x];
}

/// Per-operation limit for a tier. `-1` means unlimited. Resizes are
/// metered but never capped, for any tier.
pub fn operation_limit(tier: Tier, operation: Operation) -> i64 {
    match operation {
        Operation::Resize => -1,
        Operation::Upscale2x => match tier {
            Tier::Guest => 3,
            Tier::Free => 5,
            Tier::Pro => 50,
            Tier::Business => -1,
            Tier::Admin => -1,
        },
        Operation::Upscale4x => match tier {
            Tier::Guest => 1,
            Tier::Free => 2,
            Tier::Pro => 20,
            Tier::Business => 100,
            Tier::Admin => -1,
        },
    }
}

pub fn max_upload_bytes(tier: Tier) -> usize {
    let megabytes = match tier {
        Tier::Guest => 5,
        Tier::Free => 10,
        Tier::Pro => 25,
        Tier::Business | Tier::Admin => 100,
    };
    megabytes * 1024 * 1024
}

/// The full Real-ESRGAN model is reserved for paying tiers.
pub fn pro_model_allowed(tier: Tier) -> bool {
    matches!(tier, Tier::Pro | Tier::Business | Tier::Admin)
}
