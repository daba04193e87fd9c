//! Helpers for bounded configuration values.

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy, Debug)]
pub struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    pub const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    pub fn default(self) -> T {
        self.def
    }

    /// Returns the smallest accepted value.
    pub fn min(self) -> T {
        self.min
    }

    /// Returns the largest accepted value.
    pub fn max(self) -> T {
        self.max
    }

    /// Trims the given value to fit into the minimum/maximum range.
    ///
    /// Values that cannot be compared at all, such as a floating point NaN,
    /// are replaced by the default.
    pub fn limit(self, value: T) -> T
    where
        T: PartialOrd,
    {
        if value < self.min {
            self.min
        } else if value > self.max {
            self.max
        } else if value >= self.min && value <= self.max {
            value
        } else {
            self.def
        }
    }
}

//============ Tests =========================================================
