//! Configuration parsing and validation for collision simulations

use std::fs;
use std::path::Path;

use kernel::{ParticleProperties, PipelineConfig, PropertiesTable, MAX_SCAN_ELEMENTS};
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid configuration JSON.
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Execution backend for the collision kernel
    #[serde(default)]
    pub backend: BackendType,
    /// Number of particle slots
    pub max_particles: usize,
    /// Half-width of the square world; positions live in `[-extent, extent]`
    #[serde(default = "default_world_extent")]
    pub world_extent: f32,
    /// Timestep (seconds)
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// Gravity vector (world units / s^2)
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 2],
    /// Candidate slots per particle
    #[serde(default = "default_candidate_capacity")]
    pub candidate_capacity: usize,
    /// Particle types; type indices start at 1 in declaration order
    pub particle_types: Vec<ParticleTypeConfig>,
    /// Particle sources
    #[serde(default)]
    pub emitters: Vec<EmitterConfig>,
    /// What happens to particles that leave the world
    #[serde(default)]
    pub boundary: BoundaryBehavior,
    /// Stop after this many steps
    pub max_steps: Option<u64>,
    /// Seed for emitter randomness
    #[serde(default)]
    pub seed: u64,
}

/// Which kernel implementation runs the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// Data-parallel CPU kernel
    #[default]
    Cpu,
    /// wgpu compute kernel
    Gpu,
    /// GPU when available, CPU otherwise
    Auto,
}

/// Boundary handling at the world edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryBehavior {
    /// Mirror the position and flip the normal velocity
    #[default]
    Reflect,
    /// Deactivate the particle so its slot can be emitted again
    Recycle,
}

/// One particle type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleTypeConfig {
    /// Name referenced by emitters
    pub name: String,
    /// Mass; must be positive
    pub mass: f32,
    /// Collision radius; must be positive
    pub radius: f32,
}

/// Emitter description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmitterConfig {
    /// Particles leave a single point in random directions
    Point {
        /// Emission point
        position: [f32; 2],
        /// Initial speed
        speed: f32,
        /// Half-angle of the emission cone around +y (radians)
        #[serde(default = "default_spread")]
        spread: f32,
        /// Particles per second
        rate: f32,
        /// Name of the emitted particle type
        particle_type: String,
    },
    /// Particles appear at random points along a segment
    Bar {
        /// Segment start
        start: [f32; 2],
        /// Segment end
        end: [f32; 2],
        /// Initial velocity
        velocity: [f32; 2],
        /// Particles per second
        rate: f32,
        /// Name of the emitted particle type
        particle_type: String,
    },
}

impl EmitterConfig {
    /// Name of the emitted particle type
    pub fn particle_type(&self) -> &str {
        match self {
            EmitterConfig::Point { particle_type, .. } | EmitterConfig::Bar { particle_type, .. } => {
                particle_type
            }
        }
    }

    /// Emission rate in particles per second
    pub fn rate(&self) -> f32 {
        match self {
            EmitterConfig::Point { rate, .. } | EmitterConfig::Bar { rate, .. } => *rate,
        }
    }
}

// Default values
fn default_world_extent() -> f32 {
    1.0
}

fn default_dt() -> f32 {
    1.0 / 120.0
}

fn default_gravity() -> [f32; 2] {
    [0.0, -1.0]
}

fn default_candidate_capacity() -> usize {
    8
}

fn default_spread() -> f32 {
    0.5
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_particles == 0 {
            return invalid("max_particles must be at least 1".into());
        }
        if self.max_particles > MAX_SCAN_ELEMENTS {
            return invalid(format!(
                "max_particles {} exceeds the supported maximum {}",
                self.max_particles, MAX_SCAN_ELEMENTS
            ));
        }
        if !(self.world_extent.is_finite() && self.world_extent > 0.0) {
            return invalid("world_extent must be positive".into());
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return invalid("dt must be positive".into());
        }
        if self.candidate_capacity == 0 {
            return invalid("candidate_capacity must be at least 1".into());
        }
        if let Some(0) = self.max_steps {
            return invalid("max_steps must be at least 1".into());
        }

        if self.particle_types.is_empty() {
            return invalid("at least one particle type is required".into());
        }
        for (i, t) in self.particle_types.iter().enumerate() {
            if !(t.mass > 0.0) {
                return invalid(format!("particle type '{}' must have positive mass", t.name));
            }
            if !(t.radius > 0.0) {
                return invalid(format!("particle type '{}' must have positive radius", t.name));
            }
            if self.particle_types[..i].iter().any(|o| o.name == t.name) {
                return invalid(format!("duplicate particle type '{}'", t.name));
            }
        }

        for emitter in &self.emitters {
            if self.type_index(emitter.particle_type()).is_none() {
                return invalid(format!(
                    "emitter references unknown particle type '{}'",
                    emitter.particle_type()
                ));
            }
            if !(emitter.rate() >= 0.0) {
                return invalid("emitter rate must be non-negative".into());
            }
        }

        Ok(())
    }

    /// Properties table index of the named type
    pub fn type_index(&self, name: &str) -> Option<u32> {
        self.particle_types
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u32 + 1)
    }

    /// Properties table with the reserved "no type" entry at index 0
    pub fn properties_table(&self) -> PropertiesTable {
        let types: Vec<ParticleProperties> = self
            .particle_types
            .iter()
            .map(|t| ParticleProperties {
                mass: t.mass,
                radius: t.radius,
            })
            .collect();
        PropertiesTable::new(&types)
    }

    /// Kernel sizes
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            capacity: self.max_particles,
            world_extent: self.world_extent,
            candidate_capacity: self.candidate_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "name": "test",
        "max_particles": 128,
        "particle_types": [
            { "name": "sand", "mass": 1.0, "radius": 0.01 },
            { "name": "rock", "mass": 4.0, "radius": 0.03 }
        ],
        "emitters": [
            { "Point": { "position": [0.0, 0.5], "speed": 1.0, "rate": 60.0, "particle_type": "rock" } },
            { "Bar": { "start": [-0.5, 0.9], "end": [0.5, 0.9], "velocity": [0.0, -0.2], "rate": 30.0, "particle_type": "sand" } }
        ]
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = SimulationConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.backend, BackendType::Cpu);
        assert_eq!(config.boundary, BoundaryBehavior::Reflect);
        assert_eq!(config.candidate_capacity, 8);
        assert_eq!(config.gravity, [0.0, -1.0]);
        assert!((config.world_extent - 1.0).abs() < 1e-6);
        assert!(config.max_steps.is_none());
        match &config.emitters[0] {
            EmitterConfig::Point { spread, .. } => assert!((spread - 0.5).abs() < 1e-6),
            other => panic!("expected point emitter, got {other:?}"),
        }
    }

    #[test]
    fn test_type_indices_start_at_one() {
        let config = SimulationConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.type_index("sand"), Some(1));
        assert_eq!(config.type_index("rock"), Some(2));
        assert_eq!(config.type_index("water"), None);

        let table = config.properties_table();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(0).mass, 0.0);
        assert_eq!(table.get(2).mass, 4.0);
    }

    #[test]
    fn test_validation_unknown_type() {
        let mut config = SimulationConfig::from_json(MINIMAL).unwrap();
        config.emitters.push(EmitterConfig::Point {
            position: [0.0, 0.0],
            speed: 1.0,
            spread: 0.1,
            rate: 1.0,
            particle_type: "water".into(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_sizes() {
        let mut config = SimulationConfig::from_json(MINIMAL).unwrap();
        config.max_particles = MAX_SCAN_ELEMENTS + 1;
        assert!(config.validate().is_err());
        config.max_particles = 0;
        assert!(config.validate().is_err());
        config.max_particles = 64;
        config.candidate_capacity = 0;
        assert!(config.validate().is_err());
        config.candidate_capacity = 4;
        config.dt = 0.0;
        assert!(config.validate().is_err());
        config.dt = 0.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_particle_types() {
        let mut config = SimulationConfig::from_json(MINIMAL).unwrap();
        config.particle_types[0].mass = 0.0;
        assert!(config.validate().is_err());
        config.particle_types[0].mass = 1.0;
        config.particle_types[1].name = "sand".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            SimulationConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            SimulationConfig::load("does/not/exist.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
