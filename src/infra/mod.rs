mod pathfinding;
mod types;

pub use pathfinding::{Dijkstra, ShortestPathTree};
pub use types::{
    ELEVATION_LEVELS, NUM_VIEWS, Position, VIEW_ANGLE, VIEWS_PER_LEVEL, angle_feature,
    elevation_level, heading_index, normalize_heading, view_index,
};
