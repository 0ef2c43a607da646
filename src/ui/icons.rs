pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const WARN: &str = "⚠️";
    pub const INFO: &str = "ℹ️";
    pub const DATABASE: &str = "🗄️";
    pub const ROOT: &str = "🌱";
    pub const DEL: &str = "🗑️";
    pub const GEAR: &str = "⚙️";
}
