pub mod feed;
pub mod networks;

pub mod interfaces {
    pub mod wave_portal;
}
