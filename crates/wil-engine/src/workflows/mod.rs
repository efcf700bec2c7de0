pub mod placements;
pub mod roster;
