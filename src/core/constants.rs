/// Program and mint addresses plus layout constants used across the crate

/// Dynamic Bonding Curve program that owns the launch pools
pub const DBC_PROGRAM: &str = "dbcij3LWUppWqq96dh6gJWwBifmcGfLSB5D4DuSMaqN";

/// Default address mentioned by the listing log subscription
pub const DEFAULT_LAUNCH_PROGRAM: &str = "5qWya6UjwWnGVhdSBL3hyZ7B45jbk6Byt1hwd7ohEGXE";

/// Wrapped SOL mint, the quote side of every pool
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
pub const WSOL_DECIMALS: u8 = 9;

/// Log markers that together identify a new listing
pub const VAULT_EXECUTE_MARKER: &str = "VaultTransactionExecute";
pub const INITIALIZE_MINT_MARKER: &str = "InitializeMint";

/// Offset of the base mint inside a virtual pool account, discriminator included
pub const POOL_BASE_MINT_OFFSET: usize = 136;

/// Anchor account discriminator length
pub const DISCRIMINATOR_LEN: usize = 8;

pub const SOLSCAN_TX: &str = "https://solscan.io/tx";
