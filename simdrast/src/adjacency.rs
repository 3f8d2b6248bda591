//! Triangle adjacency.
//!
//! For a triangle list of `n` indices, the adjacency buffer has `n` entries.
//! Entry `3t + j` describes the edge from vertex `j` to vertex `(j + 1) % 3`
//! of triangle `t`: it holds the index of the other triangle sharing the edge,
//! or [`NO_NEIGHBOR`] if the edge is open. Edges are matched regardless of
//! their direction. On non-manifold edges, every later occurrence is paired with
//! the first one.
use std::collections::HashMap;

/// The adjacency entry of an open edge.
pub const NO_NEIGHBOR: u32 = 0xffff_ffff;

/// Generate the adjacency buffer of the triangle list `indices`.
pub fn generate(indices: &[u32]) -> Vec<u32> {
    log::debug!("Calculating adjacency of {} triangle(s)", indices.len() / 3);

    let count = indices.len() / 3 * 3;
    let mut adjacency = vec![NO_NEIGHBOR; count];
    let mut open_edges: HashMap<(u32, u32), u32> = HashMap::with_capacity(count);

    for (i, tri) in indices[..count].chunks_exact(3).enumerate() {
        for j in 0..3 {
            let (i0, i1) = (tri[j], tri[(j + 1) % 3]);
            let key = (i0.min(i1), i0.max(i1));
            let edge = (i * 3 + j) as u32;

            match open_edges.get(&key) {
                Some(&other) => {
                    adjacency[other as usize] = edge;
                    adjacency[edge as usize] = other;
                }
                None => {
                    open_edges.insert(key, edge);
                }
            }
        }
    }

    // Edge indices → triangle indices
    for x in adjacency.iter_mut() {
        if *x != NO_NEIGHBOR {
            *x /= 3;
        }
    }

    adjacency
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn quad() {
        // 0 - 1
        // | / |
        // 2 - 3
        let adj = generate(&[0, 2, 1, 1, 2, 3]);
        assert_eq!(
            adj,
            vec![NO_NEIGHBOR, 1, NO_NEIGHBOR, 0, NO_NEIGHBOR, NO_NEIGHBOR]
        );
    }

    #[test]
    fn closed_tetrahedron() {
        let adj = generate(&[0, 1, 2, 0, 3, 1, 1, 3, 2, 2, 3, 0]);
        assert!(adj.iter().all(|&x| x != NO_NEIGHBOR && x < 4));
    }

    /// Adjacency is symmetric for manifold meshes: if the edge `e` of `t`
    /// names `u`, then some edge of `u` names `t`.
    #[quickcheck]
    fn symmetric_on_grid(w: u8, h: u8) -> bool {
        let (w, h) = (w as u32 % 12 + 1, h as u32 % 12 + 1);
        let mut indices = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let v = |x: u32, y: u32| x + y * (w + 1);
                indices.extend_from_slice(&[v(x, y), v(x, y + 1), v(x + 1, y)]);
                indices.extend_from_slice(&[v(x + 1, y), v(x, y + 1), v(x + 1, y + 1)]);
            }
        }
        let adj = generate(&indices);

        let num_open = adj.iter().filter(|&&x| x == NO_NEIGHBOR).count() as u32;
        let symmetric = adj.iter().enumerate().all(|(e, &u)| {
            u == NO_NEIGHBOR || adj[u as usize * 3..][..3].contains(&(e as u32 / 3))
        });
        symmetric && num_open == 2 * (w + h)
    }
}
