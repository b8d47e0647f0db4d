//! Sounds, particles and explosions sent straight to chosen viewers.

use std::f64::consts::PI;
use std::sync::Arc;

use mc_intercept_proto::{Location, PacketContainer, PacketType, Schema};

use crate::error::InterceptError;
use crate::host::{ConnectionId, PacketSender, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundCategory {
    #[default]
    Master,
    Music,
    Records,
    Weather,
    Blocks,
    Hostile,
    Neutral,
    Players,
    Ambient,
    Voice,
}

impl SoundCategory {
    pub fn id(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub id: i32,
    pub count: i32,
    pub offset: [f32; 3],
    pub speed: f32,
    pub long_distance: bool,
}

impl Particle {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            count: 1,
            offset: [0.0; 3],
            speed: 0.0,
            long_distance: true,
        }
    }

    pub fn count(mut self, count: i32) -> Self {
        self.count = count;
        self
    }

    pub fn offset(mut self, x: f32, y: f32, z: f32) -> Self {
        self.offset = [x, y, z];
        self
    }

    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }
}

/// Sound positions travel as fixed-point integers, eighths of a block.
fn sound_coord(v: f64) -> i32 {
    (v * 8.0) as i32
}

pub struct PacketEffects {
    schema: Arc<Schema>,
    sender: Arc<dyn PacketSender>,
}

impl PacketEffects {
    pub fn new(schema: Arc<Schema>, sender: Arc<dyn PacketSender>) -> Self {
        Self { schema, sender }
    }

    pub fn sound_packet(
        &self,
        sound_id: i32,
        category: SoundCategory,
        at: Location,
        volume: f32,
        pitch: f32,
    ) -> Result<PacketContainer, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerNamedSoundEffect)?;
        packet
            .integers()
            .write(0, sound_id)?
            .write(1, category.id())?
            .write(2, sound_coord(at.x))?
            .write(3, sound_coord(at.y))?
            .write(4, sound_coord(at.z))?;
        packet.floats().write(0, volume)?.write(1, pitch)?;
        packet.longs().write(0, rand::random())?;
        Ok(packet)
    }

    pub fn play_sound(
        &self,
        sound_id: i32,
        category: SoundCategory,
        at: Location,
        volume: f32,
        pitch: f32,
        viewers: &[ConnectionId],
    ) -> Result<usize, InterceptError> {
        let packet = self.sound_packet(sound_id, category, at, volume, pitch)?;
        Ok(self.send_each(&packet, viewers))
    }

    pub fn play_custom_sound(
        &self,
        sound: &str,
        category: SoundCategory,
        at: Location,
        volume: f32,
        pitch: f32,
        viewers: &[ConnectionId],
    ) -> Result<usize, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerCustomSoundEffect)?;
        packet.strings().write(0, sound.to_string())?;
        packet
            .integers()
            .write(0, category.id())?
            .write(1, sound_coord(at.x))?
            .write(2, sound_coord(at.y))?
            .write(3, sound_coord(at.z))?;
        packet.floats().write(0, volume)?.write(1, pitch)?;
        packet.longs().write(0, rand::random())?;
        Ok(self.send_each(&packet, viewers))
    }

    pub fn particle_packet(&self, particle: Particle, at: Location) -> Result<PacketContainer, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerWorldParticles)?;
        packet.integers().write(0, particle.id)?.write(1, particle.count)?;
        packet.booleans().write(0, particle.long_distance)?;
        packet.doubles().write(0, at.x)?.write(1, at.y)?.write(2, at.z)?;
        let [ox, oy, oz] = particle.offset;
        packet
            .floats()
            .write(0, ox)?
            .write(1, oy)?
            .write(2, oz)?
            .write(3, particle.speed)?;
        Ok(packet)
    }

    pub fn spawn_particle(
        &self,
        particle: Particle,
        at: Location,
        viewers: &[ConnectionId],
    ) -> Result<usize, InterceptError> {
        let packet = self.particle_packet(particle, at)?;
        Ok(self.send_each(&packet, viewers))
    }

    /// Scatter `count` single particles over a sphere of `radius` around `center`.
    pub fn particle_burst(
        &self,
        particle: Particle,
        center: Location,
        radius: f64,
        count: usize,
        viewers: &[ConnectionId],
    ) -> Result<usize, InterceptError> {
        let mut sent = 0;
        for _ in 0..count {
            let azimuth = rand::random::<f64>() * PI * 2.0;
            let polar = rand::random::<f64>() * PI;
            let at = Location::new(
                center.x + radius * polar.sin() * azimuth.cos(),
                center.y + radius * polar.sin() * azimuth.sin(),
                center.z + radius * polar.cos(),
            );
            sent += self.spawn_particle(particle.count(1), at, viewers)?;
        }
        Ok(sent)
    }

    /// Client-side explosion: flash, sound and debris, no knockback and no block damage.
    pub fn explosion(&self, center: Location, power: f32, viewers: &[ConnectionId]) -> Result<usize, InterceptError> {
        let mut packet = PacketContainer::create(&self.schema, PacketType::PlayServerExplosion)?;
        packet
            .doubles()
            .write(0, center.x)?
            .write(1, center.y)?
            .write(2, center.z)?;
        packet.floats().write(0, power)?;
        Ok(self.send_each(&packet, viewers))
    }

    fn send_each(&self, packet: &PacketContainer, viewers: &[ConnectionId]) -> usize {
        viewers
            .iter()
            .filter(|viewer| self.sender.send_packet(**viewer, packet.deep_clone()) == SendOutcome::Sent)
            .count()
    }
}
