// 🛡️ Zero-Trust Architecture: every shell-out goes through `command`, every
// identifier through `validate`, every secret through `secrets`.

pub mod traits;     // Backend contracts
pub mod secrets;    // Memory hygiene (Credential)
pub mod validate;   // Identifier validation
pub mod command;    // Process execution
pub mod backups;    // Zone-file backups
pub mod dns;        // dnsmasq zone file
pub mod database;   // MongoDB principals
pub mod image;      // Image builds
pub mod container;  // docker compose instances

#[cfg(test)]
pub mod memory;     // In-memory adapters with fault injection
