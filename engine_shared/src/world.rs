//! World simulation: a grid of chunks, a fixed-rate tick loop integrating
//! client velocity, and the broadcast of resulting position deltas.
//!
//! World holds no reference to the client registry; it only knows the
//! [`crate::registry::Broadcaster`] capability, which the registry
//! implements. Breaking that reference is what stops World and Registry
//! from needing to know about each other's concrete types — the dispatcher
//! wires `add_client`/`remove_client` calls between them explicitly instead.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use crate::math::IVec2;
use crate::net::{ClientId, Response};
use crate::registry::{Broadcaster, Client};

struct WorldState {
    /// `[y][x]` grid of per-chunk client sets.
    chunks: Vec<Vec<HashSet<ClientId>>>,
    clients: HashMap<ClientId, Arc<Client>>,
    moved: Vec<ClientId>,
}

/// A width x height grid of chunk_width x chunk_height chunks, stepped at a
/// fixed tick rate.
pub struct World {
    pub width: i32,
    pub height: i32,
    pub chunk_width: i32,
    pub chunk_height: i32,
    pub tps: u32,
    pub spawn_point: IVec2,
    state: Mutex<WorldState>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl World {
    pub fn new(
        width: i32,
        height: i32,
        chunk_width: i32,
        chunk_height: i32,
        tps: u32,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let mut chunks = Vec::with_capacity(height as usize);
        for _ in 0..height {
            let mut row = Vec::with_capacity(width as usize);
            for _ in 0..width {
                row.push(HashSet::new());
            }
            chunks.push(row);
        }
        Self {
            width,
            height,
            chunk_width,
            chunk_height,
            tps,
            spawn_point: IVec2::new(width / 2, height / 2),
            state: Mutex::new(WorldState {
                chunks,
                clients: HashMap::new(),
                moved: Vec::new(),
            }),
            broadcaster,
        }
    }

    fn extent(&self) -> IVec2 {
        IVec2::new(self.chunk_width, self.chunk_height)
    }

    /// Places `client` in the chunk at `spawn_point` and starts tracking it.
    pub fn add_client(&self, client: Arc<Client>) {
        let mut state = self.state.lock().expect("world lock poisoned");
        let spawn = self.spawn_point;
        client.set_pos_chunk(client.pos(), spawn);
        state.chunks[spawn.y as usize][spawn.x as usize].insert(client.id);
        state.clients.insert(client.id, client);
    }

    /// Places `client` directly into `chunk`, bypassing `spawn_point`. Only
    /// used by tests that need to seed a client near a chunk boundary.
    #[cfg(test)]
    fn place_at(&self, client: Arc<Client>, chunk: IVec2) {
        let mut state = self.state.lock().expect("world lock poisoned");
        client.set_pos_chunk(client.pos(), chunk);
        state.chunks[chunk.y as usize][chunk.x as usize].insert(client.id);
        state.clients.insert(client.id, client);
    }

    /// Stops tracking `id`, removing it from its current chunk.
    pub fn remove_client(&self, id: ClientId) {
        let mut state = self.state.lock().expect("world lock poisoned");
        if let Some(client) = state.clients.remove(&id) {
            let chunk = client.chunk();
            if let Some(row) = state.chunks.get_mut(chunk.y as usize) {
                if let Some(set) = row.get_mut(chunk.x as usize) {
                    set.remove(&id);
                }
            }
        }
    }

    fn in_bounds(&self, chunk: IVec2) -> bool {
        chunk.x >= 0 && chunk.x < self.width && chunk.y >= 0 && chunk.y < self.height
    }

    /// Migrates a client to the chunk at `(x, y)`. Rejects out-of-bounds
    /// destinations. A no-op destination (the client's current chunk) still
    /// marks the client moved, so idle clients surface into the next
    /// broadcast.
    pub fn move_client(&self, id: ClientId, x: i32, y: i32) -> bool {
        let dest = IVec2::new(x, y);
        if !self.in_bounds(dest) {
            return false;
        }
        let mut state = self.state.lock().expect("world lock poisoned");
        let Some(client) = state.clients.get(&id).cloned() else {
            return false;
        };
        let current = client.chunk();
        if current == dest {
            state.moved.push(id);
            return true;
        }

        if let Some(set) = state
            .chunks
            .get_mut(current.y as usize)
            .and_then(|row| row.get_mut(current.x as usize))
        {
            set.remove(&id);
        }
        state.chunks[dest.y as usize][dest.x as usize].insert(id);

        let normalized = client.pos().rem_euclid(self.extent());
        client.set_pos_chunk(normalized, dest);
        state.moved.push(id);
        true
    }

    /// Integrates one client's velocity for `delta` (the project's
    /// `1 - elapsed.seconds` convention; see `run_tick_loop`).
    fn integrate_client(&self, id: ClientId, delta: f64) {
        let client = {
            let state = self.state.lock().expect("world lock poisoned");
            match state.clients.get(&id) {
                Some(c) => c.clone(),
                None => return,
            }
        };
        let vel = client.vel();
        if vel.is_zero() {
            return;
        }
        let pos = client.pos();
        let chunk = client.chunk();
        let extent = self.extent();

        let hold_x = (pos.x as f64 + vel.x * delta) as i32;
        let hold_y = (pos.y as f64 + vel.y * delta) as i32;
        let hold = IVec2::new(hold_x, hold_y);
        let wrapped = hold.rem_euclid(extent);

        if wrapped != hold {
            let n = hold.div_euclid(extent);
            let dest = IVec2::new(chunk.x + n.x, chunk.y + n.y);
            if self.move_client(id, dest.x, dest.y) {
                client.set_pos_chunk(wrapped, dest);
            } else {
                let clamped_x = (pos.x as f64 + vel.x).clamp(0.0, self.chunk_width as f64) as i32;
                let clamped_y = (pos.y as f64 + vel.y).clamp(0.0, self.chunk_height as f64) as i32;
                client.set_pos_chunk(IVec2::new(clamped_x, clamped_y), chunk);
            }
        } else {
            client.set_pos_chunk(hold, chunk);
            self.move_client(id, chunk.x, chunk.y);
        }
    }

    /// One tick: integrate every occupied chunk's clients, then broadcast
    /// and clear the moved set.
    pub fn step(&self, delta: f64) {
        let occupied: Vec<ClientId> = {
            let state = self.state.lock().expect("world lock poisoned");
            state
                .chunks
                .iter()
                .flatten()
                .filter(|set| !set.is_empty())
                .flatten()
                .copied()
                .collect()
        };
        for id in occupied {
            self.integrate_client(id, delta);
        }
        self.send_positions();
    }

    /// Broadcasts a `position-update` for every client moved this tick,
    /// then clears the moved set.
    fn send_positions(&self) {
        let moved = {
            let mut state = self.state.lock().expect("world lock poisoned");
            std::mem::take(&mut state.moved)
        };
        for id in moved {
            let state = self.state.lock().expect("world lock poisoned");
            let Some(client) = state.clients.get(&id).cloned() else {
                continue;
            };
            drop(state);
            self.broadcaster.broadcast(&Response::PositionUpdate {
                id,
                position: client.position_fields(),
            });
        }
    }

    /// Sends `target_addr` a `client-update` for every tracked client.
    pub fn full_update(&self, target_addr: SocketAddr) {
        let clients: Vec<Arc<Client>> = {
            let state = self.state.lock().expect("world lock poisoned");
            state.clients.values().cloned().collect()
        };
        for client in clients {
            self.broadcaster.send_to(
                target_addr,
                &Response::ClientUpdate {
                    id: client.id,
                    name: client.name.clone(),
                    position: client.position_fields(),
                },
            );
        }
    }
}

/// Drives [`World::step`] at a fixed `1/tps` cadence, computing `delta` the
/// same way the reference world does: `1 - elapsed_since_last_tick`. This is
/// not a physical delta (it goes negative once a tick takes over a second)
/// but changing it would change observable movement speed, so it's kept.
pub async fn run_tick_loop(world: Arc<World>, running: Arc<std::sync::atomic::AtomicBool>) {
    let mut last = tokio::time::Instant::now();
    let period = std::time::Duration::from_secs_f64(1.0 / world.tps.max(1) as f64);
    while running.load(std::sync::atomic::Ordering::Relaxed) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(last);
        last = now;
        let delta = 1.0 - elapsed.as_secs_f64();
        world.step(delta);
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::FVec2;
    use crate::net::ClientId;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    struct NullBroadcaster;
    impl Broadcaster for NullBroadcaster {
        fn send_to(&self, _addr: SocketAddr, _response: &Response) {}
        fn broadcast(&self, _response: &Response) {}
    }

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1)
    }

    fn test_client() -> Arc<Client> {
        Arc::new(Client::new(
            ClientId::new_unique(),
            "dave".to_string(),
            "sess".to_string(),
            test_addr(),
            0,
            IVec2::ZERO,
            IVec2::ZERO,
        ))
    }

    fn small_world() -> World {
        World::new(4, 4, 10, 10, 20, Arc::new(NullBroadcaster))
    }

    #[test]
    fn add_client_places_at_spawn_point() {
        let world = small_world();
        let client = test_client();
        world.add_client(client.clone());
        assert_eq!(client.chunk(), world.spawn_point);
    }

    #[test]
    fn boundary_crossing_migrates_to_neighbor_chunk() {
        let world = small_world();
        let client = test_client();
        client.set_pos_chunk(IVec2::new(9, 0), IVec2::new(1, 1));
        world.place_at(client.clone(), IVec2::new(1, 1));
        client.set_vel(FVec2::new(1.0, 0.0));

        world.step(1.0);

        assert_eq!(client.chunk(), IVec2::new(2, 1));
        assert_eq!(client.pos(), IVec2::new(0, 0));
    }

    #[test]
    fn migration_out_of_grid_clamps_instead_of_moving() {
        let world = small_world();
        let client = test_client();
        client.set_pos_chunk(IVec2::new(9, 0), IVec2::new(3, 0));
        world.place_at(client.clone(), IVec2::new(3, 0));
        client.set_vel(FVec2::new(1.0, 0.0));

        world.step(1.0);

        assert_eq!(client.chunk(), IVec2::new(3, 0));
        assert_eq!(client.pos(), IVec2::new(10, 0));
    }

    #[test]
    fn move_client_rejects_out_of_bounds() {
        let world = small_world();
        let client = test_client();
        world.add_client(client.clone());
        assert!(!world.move_client(client.id, -1, 0));
        assert!(!world.move_client(client.id, world.width, 0));
    }

    #[test]
    fn zero_velocity_client_is_not_marked_moved() {
        let world = small_world();
        let client = test_client();
        world.add_client(client.clone());
        // Zero velocity: integrate_client returns early, never reaching
        // move_client, so nothing is marked moved and no broadcast fires.
        world.step(1.0);
        let state = world.state.lock().unwrap();
        assert!(state.moved.is_empty());
    }
}
