pub const MAX_RESOURCE_KEY_LEN: usize = 64;
pub const MAX_FIELD_LEN: usize = 512;
pub const MAX_COLLEAGUES: usize = 32;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 10_000;
