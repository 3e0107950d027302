/// A vertex of the navigable graph.
///
/// `slot` addresses the vector in the owning index; `links[l]` holds the
/// neighbour slots on layer `l`. Layer 0 contains every node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub slot: usize,
    pub links: Vec<Vec<usize>>,
}

impl Node {
    pub fn new(slot: usize, top_layer: usize) -> Self {
        Self {
            slot,
            links: vec![Vec::new(); top_layer + 1],
        }
    }

    pub fn top_layer(&self) -> usize {
        self.links.len().saturating_sub(1)
    }

    pub fn neighbors(&self, layer: usize) -> &[usize] {
        self.links.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn link(&mut self, layer: usize, slot: usize) {
        if let Some(list) = self.links.get_mut(layer) {
            if !list.contains(&slot) {
                list.push(slot);
            }
        }
    }

    pub fn unlink(&mut self, slot: usize) {
        for list in &mut self.links {
            list.retain(|&n| n != slot);
        }
    }

    pub fn set_neighbors(&mut self, layer: usize, slots: Vec<usize>) {
        if let Some(list) = self.links.get_mut(layer) {
            *list = slots;
        }
    }
}
