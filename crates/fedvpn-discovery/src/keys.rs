//! Discovery endpoints and the embedded trust anchors.

/// Fixed HTTPS root the federation publishes its catalogs under.
pub const DISCOVERY_ROOT: &str = "https://disco.eduvpn.org/v2/";

pub const SERVER_LIST_FILE: &str = "server_list.json";
pub const ORGANIZATION_LIST_FILE: &str = "organization_list.json";

/// Minisign public keys trusted to sign the catalogs.
///
/// Rotations land here as an additional entry; old keys are only dropped
/// once every published catalog has been re-signed.
pub const TRUSTED_KEYS: &[&str] = &[
    "RWRtBSX1alxyGX+Xn3LuZnWUT0w//B6EmTJvgaAxBMYzlQeI+jdrO6KF",
];
