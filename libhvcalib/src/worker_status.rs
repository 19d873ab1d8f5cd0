#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BarColor {
    #[default]
    CYAN,
    MAGENTA,
    RED,
    GREEN,
}

impl BarColor {
    /// Color name as understood by progress bar templates
    pub fn name(&self) -> &'static str {
        match self {
            Self::CYAN => "cyan",
            Self::MAGENTA => "magenta",
            Self::RED => "red",
            Self::GREEN => "green",
        }
    }
}

/// Progress report sent from a worker to whoever renders it
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub task: String,
    pub item: String,
    pub color: BarColor,
}

impl WorkerStatus {
    pub fn new(progress: f32, task: &str, item: &str, color: BarColor) -> Self {
        Self {
            progress,
            task: task.to_string(),
            item: item.to_string(),
            color,
        }
    }

    /// Status of `done` finished items out of `total`
    pub fn fraction(done: usize, total: usize, task: &str, item: &str) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            done as f32 / total as f32
        };
        Self::new(progress, task, item, BarColor::CYAN)
    }

    pub fn with_color(mut self, color: BarColor) -> Self {
        self.color = color;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        let status = WorkerStatus::fraction(1, 4, "calibrate", "y2009m08d21p01");
        assert_eq!(status.progress, 0.25);
        assert_eq!(status.item, "y2009m08d21p01");
        assert_eq!(WorkerStatus::fraction(0, 0, "x", "").progress, 1.0);
        assert_eq!(status.color, BarColor::CYAN);
    }

    #[test]
    fn test_colors() {
        let status = WorkerStatus::fraction(1, 2, "cluster model", "").with_color(BarColor::MAGENTA);
        assert_eq!(status.color.name(), "magenta");
        assert_eq!(BarColor::RED.name(), "red");
        assert_eq!(BarColor::default().name(), "cyan");
    }
}
